//! Conversion of an [`InstructionSequence`] into the words written to the board.

use pbcompiler_backend::utils::round_u64;
use pbcompiler_backend::{InstructionSequence, Opcode};

use crate::error::{DeviceError, Result};

/// Width of the board's flag word.
pub const NR_BOARD_FLAGS: usize = 24;

/// One instruction as passed to `pb_inst_pbonly`, with its duration in clock ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInstruction {
    pub flags: u32,
    pub opcode: Opcode,
    pub inst_data: i32,
    pub ticks: u64,
}

impl DeviceInstruction {
    /// Duration in ns on a board clocked at `clock_mhz`.
    pub fn length_ns(&self, clock_mhz: f64) -> f64 {
        self.ticks as f64 * 1e3 / clock_mhz
    }
}

/// Converts `seq` to board instructions for a core clock of `clock_mhz`.
///
/// Durations are rounded to the nearest clock tick. Flags beyond the 24 board outputs, zero-tick
/// durations and operands outside the `i32` range are rejected.
///
/// ```
/// use pbcompiler_backend::{Instruction, InstructionSequence};
/// use pbctrl_backend::program::to_device_program;
///
/// let seq = InstructionSequence::new(vec![Instruction::new_branch(0b1, 100, 0)], 24).unwrap();
/// let program = to_device_program(&seq, 250.).unwrap();
/// assert_eq!(program[0].ticks, 25);
/// ```
pub fn to_device_program(seq: &InstructionSequence, clock_mhz: f64) -> Result<Vec<DeviceInstruction>> {
    if !(clock_mhz.is_finite() && clock_mhz > 0.) {
        return Err(DeviceError::Clock(clock_mhz));
    }
    seq.instructions()
        .iter()
        .enumerate()
        .map(|(address, instr)| {
            let flags = u32::try_from(instr.flags)
                .ok()
                .filter(|flags| flags >> NR_BOARD_FLAGS == 0)
                .ok_or_else(|| DeviceError::Program {
                    address,
                    message: format!(
                        "flags 0x{:X} exceed the {} board outputs",
                        instr.flags, NR_BOARD_FLAGS
                    ),
                })?;
            let ticks = round_u64(instr.duration as f64 * clock_mhz / 1e3);
            if ticks == 0 {
                return Err(DeviceError::Program {
                    address,
                    message: format!(
                        "duration {} ns is shorter than one {} MHz clock tick",
                        instr.duration, clock_mhz
                    ),
                });
            }
            let inst_data = i32::try_from(instr.inst_data).map_err(|_| DeviceError::Program {
                address,
                message: format!("inst_data {} does not fit the board", instr.inst_data),
            })?;
            Ok(DeviceInstruction {
                flags,
                opcode: instr.opcode,
                inst_data,
                ticks,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbcompiler_backend::Instruction;

    fn sequence(instructions: Vec<Instruction>, nr_channels: usize) -> InstructionSequence {
        InstructionSequence::new(instructions, nr_channels).unwrap()
    }

    #[test]
    fn ticks_follow_the_clock() {
        let seq = sequence(
            vec![
                Instruction::new(0xFFFFFF, 1_000, Opcode::LOOP, 3),
                Instruction::new(0, 30, Opcode::END_LOOP, 0),
                Instruction::new_branch(0, 20, 0),
            ],
            24,
        );
        let program = to_device_program(&seq, 100.).unwrap();
        assert_eq!(program.iter().map(|p| p.ticks).collect::<Vec<_>>(), vec![100, 3, 2]);
        assert_eq!(program[0].flags, 0xFFFFFF);
        assert_eq!(program[0].opcode, Opcode::LOOP);
        assert_eq!(program[0].inst_data, 3);
        assert_eq!(program[1].length_ns(100.), 30.);
    }

    #[test]
    fn rejects_unrepresentable_instructions() {
        let wide = sequence(vec![Instruction::new(1 << 24, 100, Opcode::STOP, 0)], 32);
        assert!(matches!(
            to_device_program(&wide, 100.),
            Err(DeviceError::Program { address: 0, .. })
        ));

        let short = sequence(
            vec![Instruction::new_continue(0, 100), Instruction::new(0, 1, Opcode::STOP, 0)],
            24,
        );
        let err = to_device_program(&short, 100.).unwrap_err();
        assert_eq!(
            err,
            DeviceError::Program {
                address: 1,
                message: "duration 1 ns is shorter than one 100 MHz clock tick".to_string()
            }
        );

        let seq = sequence(vec![Instruction::new(0, 100, Opcode::STOP, 0)], 24);
        assert_eq!(to_device_program(&seq, 0.), Err(DeviceError::Clock(0.)));
    }
}
