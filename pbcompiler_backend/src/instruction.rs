//! Provides definitions and implementations for PulseBlaster instructions and their unrolled
//! timeline.
//!
//! ## Main Structures and Enumerations:
//!
//! - `Opcode`: The closed set of PulseBlaster opcodes (`CONTINUE`, `STOP`, `LOOP`, `END_LOOP`,
//!   `JSR`, `RTS`, `BRANCH`, `LONG_DELAY`, `WAIT`), numbered as the vendor API expects them.
//!
//! - `Instruction`: One program word: a flag bitmask, a duration in ns, an opcode and its
//!   opcode-dependent `inst_data` (loop count, subroutine address or branch address).
//!
//! - `InstructionSequence`: An ordered program together with its unrolled timeline (duration
//!   and flags of every executed step, and the step a terminal `BRANCH` returns to). This is the
//!   object handed to the device driver and to plotting code.
//!
//! ## Unrolling
//!
//! [`unroll_duration_flags`] interprets the control flow of a program with an explicit
//! subroutine-return stack and loop stack, both bounded by [`UnrollLimits`]. Loops and
//! subroutine calls are expanded in full. Every structural error (RTS without JSR, END_LOOP
//! without LOOP, out-of-range targets, non-positive loop counts) is reported as
//! [`CompileError::ControlFlow`] naming the address at fault, as is a program that exceeds the
//! step limit or whose total duration does not fit a `u64`.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;

use crate::config::{validate_channel_count, UnrollLimits, MAX_CHANNELS};
use crate::error::{CompileError, Result};

/// PulseBlaster opcodes. The discriminants are the values the vendor API expects.
///
/// - `CONTINUE`: proceed to the next instruction.
/// - `STOP`: stop execution.
/// - `LOOP`: start of a loop, `inst_data` = number of iterations.
/// - `END_LOOP`: end of the innermost loop.
/// - `JSR`: jump to the subroutine at address `inst_data`.
/// - `RTS`: return from subroutine.
/// - `BRANCH`: branch to address `inst_data`.
/// - `LONG_DELAY`: repeat the instruction's delay.
/// - `WAIT`: wait for an external trigger.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    CONTINUE = 0,
    STOP = 1,
    LOOP = 2,
    END_LOOP = 3,
    JSR = 4,
    RTS = 5,
    BRANCH = 6,
    LONG_DELAY = 7,
    WAIT = 8,
}

impl Opcode {
    pub const ALL: [Opcode; 9] = [
        Opcode::CONTINUE,
        Opcode::STOP,
        Opcode::LOOP,
        Opcode::END_LOOP,
        Opcode::JSR,
        Opcode::RTS,
        Opcode::BRANCH,
        Opcode::LONG_DELAY,
        Opcode::WAIT,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::CONTINUE => "CONTINUE",
            Opcode::STOP => "STOP",
            Opcode::LOOP => "LOOP",
            Opcode::END_LOOP => "END_LOOP",
            Opcode::JSR => "JSR",
            Opcode::RTS => "RTS",
            Opcode::BRANCH => "BRANCH",
            Opcode::LONG_DELAY => "LONG_DELAY",
            Opcode::WAIT => "WAIT",
        }
    }

    /// Opcode value as passed to the vendor API.
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Case-insensitive lookup by name.
///
/// ```
/// use pbcompiler_backend::instruction::Opcode;
/// assert_eq!("end_loop".parse::<Opcode>(), Ok(Opcode::END_LOOP));
/// assert!("JUMP".parse::<Opcode>().is_err());
/// ```
impl FromStr for Opcode {
    type Err = String;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        let upper = name.trim().to_ascii_uppercase();
        Opcode::ALL
            .iter()
            .find(|opcode| opcode.name() == upper)
            .copied()
            .ok_or_else(|| format!("Invalid opcode '{}'", name.trim()))
    }
}

/// One PulseBlaster program word.
///
/// - `label`: optional name used to resolve addresses while assembling.
/// - `flags`: output state, bit `n` drives channel `n`.
/// - `duration`: time the instruction takes, in ns.
/// - `opcode`: see [`Opcode`].
/// - `inst_data`: opcode-dependent operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub label: Option<String>,
    pub flags: u64,
    pub duration: u64,
    pub opcode: Opcode,
    pub inst_data: i64,
}

impl Instruction {
    pub fn new(flags: u64, duration: u64, opcode: Opcode, inst_data: i64) -> Self {
        Instruction {
            label: None,
            flags,
            duration,
            opcode,
            inst_data,
        }
    }

    /// Wrapper for conveniently creating `CONTINUE` instructions.
    /// ```
    /// # use pbcompiler_backend::instruction::*;
    /// let instr = Instruction::new_continue(0b101, 100);
    /// assert!(instr.flag(0) && !instr.flag(1) && instr.flag(2));
    /// ```
    pub fn new_continue(flags: u64, duration: u64) -> Self {
        Instruction::new(flags, duration, Opcode::CONTINUE, 0)
    }

    /// Wrapper for creating a `BRANCH` back to `address`.
    pub fn new_branch(flags: u64, duration: u64, address: usize) -> Self {
        Instruction::new(flags, duration, Opcode::BRANCH, address as i64)
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// State of `channel` during this instruction.
    pub fn flag(&self, channel: usize) -> bool {
        channel < MAX_CHANNELS && (self.flags >> channel) & 1 == 1
    }

    /// Flags as a list of `nr_channels` bits, channel 0 first.
    pub fn flag_bits(&self, nr_channels: usize) -> Vec<u8> {
        (0..nr_channels).map(|c| self.flag(c) as u8).collect()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(label) = &self.label {
            write!(f, "{}: ", label)?;
        }
        write!(
            f,
            "0x{:06X}, {}ns, {}, {}",
            self.flags, self.duration, self.opcode, self.inst_data
        )
    }
}

/// An active loop while unrolling: address of its `LOOP` and the iterations still to run.
struct Loop {
    idx_start: usize,
    iterations_left: i64,
}

/// Flattened execution trace of a program.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unrolled {
    /// Duration of every executed step, in ns.
    pub durations: Vec<u64>,
    /// Flag bitmask of every executed step.
    pub flags: Vec<u64>,
    /// Program address every step was executed from.
    pub addresses: Vec<usize>,
    /// Step a terminal `BRANCH` returns to, if the target was visited.
    pub branch_index: Option<usize>,
}

/// Unrolls loops and subroutines into the duration and flags of every executed step.
///
/// Execution starts at address 0 and ends at `STOP`, at `BRANCH`, or when it runs past the last
/// instruction. For a terminal `BRANCH`, `branch_index` is the first step executed from the
/// branch target; it stays `None` if the target was never visited.
///
/// ```
/// use pbcompiler_backend::config::UnrollLimits;
/// use pbcompiler_backend::instruction::*;
///
/// let program = vec![
///     Instruction::new(0b1, 100, Opcode::LOOP, 3),
///     Instruction::new(0b0, 100, Opcode::END_LOOP, 0),
///     Instruction::new_branch(0b0, 50, 0),
/// ];
/// let unrolled = unroll_duration_flags(&program, UnrollLimits::default()).unwrap();
/// assert_eq!(unrolled.durations.len(), 7);
/// assert_eq!(unrolled.branch_index, Some(0));
/// ```
pub fn unroll_duration_flags(instructions: &[Instruction], limits: UnrollLimits) -> Result<Unrolled> {
    if instructions.is_empty() {
        return Err(CompileError::control_flow(
            0,
            "Instruction list cannot be empty",
        ));
    }
    let nr_instructions = instructions.len();
    let mut unrolled = Unrolled::default();
    let mut subroutines: Vec<usize> = Vec::with_capacity(limits.max_depth);
    let mut loops: Vec<Loop> = Vec::with_capacity(limits.max_depth);

    let mut total: u64 = 0;
    let mut idx = 0;
    while idx < nr_instructions {
        if unrolled.durations.len() >= limits.max_steps {
            return Err(CompileError::control_flow(
                idx,
                format!("unrolling exceeded {} steps", limits.max_steps),
            ));
        }
        let instruction = &instructions[idx];
        total = total.checked_add(instruction.duration).ok_or_else(|| {
            CompileError::control_flow(idx, "total duration exceeds u64::MAX ns")
        })?;
        unrolled.durations.push(instruction.duration);
        unrolled.flags.push(instruction.flags);
        unrolled.addresses.push(idx);

        match instruction.opcode {
            Opcode::CONTINUE | Opcode::LONG_DELAY | Opcode::WAIT => idx += 1,
            Opcode::JSR => {
                let target = checked_target(instruction, idx, nr_instructions)?;
                if subroutines.len() >= limits.max_depth {
                    return Err(CompileError::control_flow(
                        idx,
                        format!("subroutine nesting exceeds {} levels", limits.max_depth),
                    ));
                }
                subroutines.push(idx);
                idx = target;
            }
            Opcode::RTS => {
                let caller = subroutines.pop().ok_or_else(|| {
                    CompileError::control_flow(idx, "RTS encountered without a matching JSR")
                })?;
                idx = caller + 1;
            }
            Opcode::LOOP => {
                if instruction.inst_data <= 0 {
                    return Err(CompileError::control_flow(
                        idx,
                        format!(
                            "LOOP iterations must be positive, got {}",
                            instruction.inst_data
                        ),
                    ));
                }
                // Re-entering the innermost loop from its END_LOOP does not open a new one
                if loops.last().map_or(true, |l| l.idx_start != idx) {
                    if loops.len() >= limits.max_depth {
                        return Err(CompileError::control_flow(
                            idx,
                            format!("loop nesting exceeds {} levels", limits.max_depth),
                        ));
                    }
                    loops.push(Loop {
                        idx_start: idx,
                        iterations_left: instruction.inst_data,
                    });
                }
                idx += 1;
            }
            Opcode::END_LOOP => {
                let current = loops.last_mut().ok_or_else(|| {
                    CompileError::control_flow(idx, "END_LOOP encountered without a matching LOOP")
                })?;
                current.iterations_left -= 1;
                if current.iterations_left == 0 {
                    loops.pop();
                    idx += 1;
                } else {
                    idx = current.idx_start;
                }
            }
            Opcode::STOP => break,
            Opcode::BRANCH => {
                let target = checked_target(instruction, idx, nr_instructions)?;
                unrolled.branch_index = unrolled.addresses.iter().position(|&a| a == target);
                break;
            }
        }
    }
    Ok(unrolled)
}

fn checked_target(instruction: &Instruction, idx: usize, nr_instructions: usize) -> Result<usize> {
    usize::try_from(instruction.inst_data)
        .ok()
        .filter(|&target| target < nr_instructions)
        .ok_or_else(|| {
            CompileError::control_flow(
                idx,
                format!(
                    "{} target {} is outside instruction range 0..{}",
                    instruction.opcode, instruction.inst_data, nr_instructions
                ),
            )
        })
}

/// An ordered PulseBlaster program and its unrolled timeline.
///
/// The timeline is computed once at construction, which therefore also validates the program's
/// control flow. `durations()` and the rows of `flags()` always have equal length, and
/// `branch_index()`, if present, indexes into them.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionSequence {
    instructions: Vec<Instruction>,
    nr_channels: usize,
    durations: Vec<u64>,
    flags: Array2<u8>,
    addresses: Vec<usize>,
    branch_index: Option<usize>,
}

impl InstructionSequence {
    /// Builds a sequence with the default [`UnrollLimits`].
    pub fn new(instructions: Vec<Instruction>, nr_channels: usize) -> Result<Self> {
        Self::with_limits(instructions, nr_channels, UnrollLimits::default())
    }

    pub fn with_limits(
        instructions: Vec<Instruction>,
        nr_channels: usize,
        limits: UnrollLimits,
    ) -> Result<Self> {
        validate_channel_count(nr_channels)?;
        if let Some((address, instruction)) = instructions
            .iter()
            .enumerate()
            .find(|(_, instr)| nr_channels < MAX_CHANNELS && instr.flags >> nr_channels != 0)
        {
            return Err(CompileError::Topology(format!(
                "Instruction {} at address {} sets flags beyond {} channels",
                instruction, address, nr_channels
            )));
        }

        let unrolled = unroll_duration_flags(&instructions, limits)?;
        let flags = Array2::from_shape_fn((unrolled.flags.len(), nr_channels), |(step, chan)| {
            ((unrolled.flags[step] >> chan) & 1) as u8
        });
        Ok(InstructionSequence {
            instructions,
            nr_channels,
            durations: unrolled.durations,
            flags,
            addresses: unrolled.addresses,
            branch_index: unrolled.branch_index,
        })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
    pub fn nr_channels(&self) -> usize {
        self.nr_channels
    }
    /// Duration in ns of every unrolled step.
    pub fn durations(&self) -> &[u64] {
        &self.durations
    }
    /// Flags of every unrolled step, shape `(steps, nr_channels)`.
    pub fn flags(&self) -> &Array2<u8> {
        &self.flags
    }
    /// Program address every unrolled step was executed from.
    pub fn addresses(&self) -> &[usize] {
        &self.addresses
    }
    pub fn branch_index(&self) -> Option<usize> {
        self.branch_index
    }

    /// Duration of one pass through the unrolled program, in ns. Construction rejects programs
    /// whose total does not fit a `u64`.
    pub fn total_duration(&self) -> u64 {
        self.durations.iter().sum()
    }

    /// Duration of the part that repeats when a terminal `BRANCH` loops back, in ns.
    /// `None` if the program does not branch back.
    pub fn repeat_duration(&self) -> Option<u64> {
        self.branch_index
            .map(|start| self.durations[start..].iter().sum())
    }

    /// Start time of every step plus the end time of the last, starting from 0.
    pub fn cumulative_times(&self) -> Vec<u64> {
        std::iter::once(0)
            .chain(self.durations.iter().scan(0u64, |t, &d| {
                *t += d;
                Some(*t)
            }))
            .collect()
    }

    /// Unrolled state of a single channel.
    pub fn channel_trace(&self, channel: usize) -> Result<Vec<u8>> {
        if channel >= self.nr_channels {
            return Err(CompileError::Topology(format!(
                "channel {} is outside 0..{}",
                channel, self.nr_channels
            )));
        }
        Ok(self.flags.column(channel).to_vec())
    }

    /// Channels that are high in at least one step, leaving out `exclude`.
    pub fn active_channels(&self, exclude: &[usize]) -> Result<Vec<usize>> {
        let mut invalid: Vec<usize> = exclude
            .iter()
            .copied()
            .filter(|&chan| chan >= self.nr_channels)
            .collect();
        if !invalid.is_empty() {
            invalid.sort_unstable();
            return Err(CompileError::Topology(format!(
                "exclude_channels must be in range 0..{}, got {:?}",
                self.nr_channels - 1,
                invalid
            )));
        }
        Ok((0..self.nr_channels)
            .filter(|chan| !exclude.contains(chan))
            .filter(|&chan| self.flags.column(chan).iter().any(|&bit| bit != 0))
            .collect())
    }
}

impl fmt::Display for InstructionSequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (address, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "{:>4}: {}", address, instruction)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> UnrollLimits {
        UnrollLimits::default()
    }

    #[test]
    fn loop_expands_every_iteration() {
        let program = vec![
            Instruction::new(1, 100, Opcode::LOOP, 5),
            Instruction::new(0, 200, Opcode::END_LOOP, 0),
            Instruction::new(1, 100, Opcode::STOP, 0),
        ];
        let unrolled = unroll_duration_flags(&program, limits()).unwrap();
        assert_eq!(unrolled.durations.len(), 11);
        assert_eq!(&unrolled.addresses[..4], &[0, 1, 0, 1]);
        assert_eq!(unrolled.addresses.last(), Some(&2));
        assert_eq!(unrolled.branch_index, None);
    }

    #[test]
    fn nested_loops_multiply() {
        let program = vec![
            Instruction::new(0, 10, Opcode::LOOP, 3),
            Instruction::new(0, 10, Opcode::LOOP, 2),
            Instruction::new(1, 10, Opcode::END_LOOP, 1),
            Instruction::new(0, 10, Opcode::END_LOOP, 0),
            Instruction::new(0, 10, Opcode::STOP, 0),
        ];
        let unrolled = unroll_duration_flags(&program, limits()).unwrap();
        // Outer: 3 x (LOOP + inner 2 x (LOOP + END_LOOP) + END_LOOP) + STOP
        assert_eq!(unrolled.durations.len(), 3 * (1 + 2 * 2 + 1) + 1);
        assert_eq!(unrolled.flags.iter().filter(|&&f| f == 1).count(), 6);
    }

    #[test]
    fn subroutine_returns_after_call() {
        let program = vec![
            Instruction::new(0b01, 10, Opcode::JSR, 3),
            Instruction::new(0b10, 20, Opcode::JSR, 3),
            Instruction::new(0b00, 30, Opcode::STOP, 0),
            Instruction::new(0b11, 40, Opcode::CONTINUE, 0),
            Instruction::new(0b11, 50, Opcode::RTS, 0),
        ];
        let unrolled = unroll_duration_flags(&program, limits()).unwrap();
        assert_eq!(unrolled.addresses, vec![0, 3, 4, 1, 3, 4, 2]);
        assert_eq!(unrolled.durations.iter().sum::<u64>(), 10 + 90 + 20 + 90 + 30);
    }

    #[test]
    fn branch_index_points_at_first_visit() {
        let program = vec![
            Instruction::new_continue(0, 10),
            Instruction::new_continue(1, 10),
            Instruction::new_branch(0, 10, 1),
        ];
        let unrolled = unroll_duration_flags(&program, limits()).unwrap();
        assert_eq!(unrolled.branch_index, Some(1));

        // Branching forward to an address that was never executed
        let program = vec![
            Instruction::new_branch(0, 10, 1),
            Instruction::new_continue(1, 10),
        ];
        let unrolled = unroll_duration_flags(&program, limits()).unwrap();
        assert_eq!(unrolled.branch_index, None);
        assert_eq!(unrolled.durations, vec![10]);
    }

    #[test]
    fn running_past_the_end_terminates() {
        let program = vec![Instruction::new_continue(1, 10), Instruction::new_continue(0, 20)];
        let unrolled = unroll_duration_flags(&program, limits()).unwrap();
        assert_eq!(unrolled.durations, vec![10, 20]);
        assert_eq!(unrolled.branch_index, None);
    }

    fn control_flow_address(program: &[Instruction], limits: UnrollLimits) -> usize {
        match unroll_duration_flags(program, limits) {
            Err(CompileError::ControlFlow { address, .. }) => address,
            other => panic!("expected a control flow error, got {:?}", other),
        }
    }

    #[test]
    fn structural_errors_name_the_address() {
        let rts = vec![Instruction::new_continue(0, 10), Instruction::new(0, 10, Opcode::RTS, 0)];
        assert_eq!(control_flow_address(&rts, limits()), 1);

        let end_loop = vec![Instruction::new(0, 10, Opcode::END_LOOP, 0)];
        assert_eq!(control_flow_address(&end_loop, limits()), 0);

        let zero_loop = vec![Instruction::new_continue(0, 10), Instruction::new(0, 10, Opcode::LOOP, 0)];
        assert_eq!(control_flow_address(&zero_loop, limits()), 1);

        let jsr = vec![Instruction::new(0, 10, Opcode::JSR, 7)];
        assert_eq!(control_flow_address(&jsr, limits()), 0);

        let negative_branch = vec![Instruction::new(0, 10, Opcode::BRANCH, -1)];
        assert_eq!(control_flow_address(&negative_branch, limits()), 0);

        assert!(matches!(
            unroll_duration_flags(&[], limits()),
            Err(CompileError::ControlFlow { .. })
        ));
    }

    #[test]
    fn unbounded_programs_are_rejected() {
        // Unbounded recursion hits the stack depth
        let recursive = vec![Instruction::new(0, 10, Opcode::JSR, 0)];
        let err = unroll_duration_flags(&recursive, limits()).unwrap_err();
        assert!(err.to_string().contains("subroutine nesting"));

        // A long loop hits the step limit
        let long_loop = vec![
            Instruction::new(0, 10, Opcode::LOOP, 1_000_000),
            Instruction::new(0, 10, Opcode::END_LOOP, 0),
        ];
        let small = UnrollLimits {
            max_steps: 1000,
            max_depth: 8,
        };
        let err = unroll_duration_flags(&long_loop, small).unwrap_err();
        assert!(err.to_string().contains("exceeded 1000 steps"));
    }

    #[test]
    fn overflowing_total_duration_is_rejected() {
        let half = u64::MAX / 2 + 1;
        let program = vec![Instruction::new_continue(1, half), Instruction::new(0, half, Opcode::STOP, 0)];
        assert_eq!(control_flow_address(&program, limits()), 1);
        assert!(InstructionSequence::new(program, 1).is_err());

        let fits = vec![Instruction::new_continue(1, half), Instruction::new(0, half - 1, Opcode::STOP, 0)];
        let seq = InstructionSequence::new(fits, 1).unwrap();
        assert_eq!(seq.total_duration(), u64::MAX);
        assert_eq!(seq.cumulative_times().last(), Some(&u64::MAX));
    }

    #[test]
    fn flag_bits_start_at_channel_zero() {
        let instruction = Instruction::new_continue(0b101, 10);
        assert_eq!(instruction.flag_bits(4), vec![1, 0, 1, 0]);
        assert_eq!(instruction.flag_bits(0), Vec::<u8>::new());
    }

    #[test]
    fn sequence_projection() {
        let program = vec![
            Instruction::new_continue(0b001, 100),
            Instruction::new_continue(0b100, 50),
            Instruction::new_branch(0b000, 25, 1),
        ];
        let seq = InstructionSequence::new(program, 3).unwrap();
        assert_eq!(seq.durations(), &[100, 50, 25]);
        assert_eq!(seq.flags().dim(), (3, 3));
        assert_eq!(seq.flags().row(1).to_vec(), vec![0, 0, 1]);
        assert_eq!(seq.branch_index(), Some(1));
        assert_eq!(seq.total_duration(), 175);
        assert_eq!(seq.repeat_duration(), Some(75));
        assert_eq!(seq.cumulative_times(), vec![0, 100, 150, 175]);
        assert_eq!(seq.channel_trace(2).unwrap(), vec![0, 1, 0]);
        assert_eq!(seq.active_channels(&[]).unwrap(), vec![0, 2]);
        assert_eq!(seq.active_channels(&[0]).unwrap(), vec![2]);
        assert!(seq.active_channels(&[3]).is_err());
    }

    #[test]
    fn sequence_rejects_flags_wider_than_channels() {
        let program = vec![Instruction::new(0b1000, 10, Opcode::STOP, 0)];
        assert!(matches!(
            InstructionSequence::new(program, 3),
            Err(CompileError::Topology(_))
        ));
    }
}
