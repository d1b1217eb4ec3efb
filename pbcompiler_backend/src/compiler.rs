//! Compiles a set of periodic signals into one repeating PulseBlaster program.
//!
//! ## Pipeline
//!
//! 1. [`minimum_duration_and_num_cycles`] finds a repeating duration in which every signal
//!    completes an integer number of periods, rescaling the frequencies to fit it.
//! 2. [`quantize_and_coarsen`] converts the rescaled signals to pulses counted in time quanta and
//!    grows the quantum by the greatest common divisor of all counts.
//! 3. [`SequenceCompiler::compile`] simulates the channel state of every quantum, merges runs of
//!    identical states into single `CONTINUE` instructions and closes the program with a
//!    one-quantum `BRANCH` back to address 0 that switches every signal off.
//!
//! ## Channel state
//!
//! For each simulated time step:
//! - A primary pulse drives its channels high while its elapsed counter is below `high`.
//! - Masking pulses start from the union of every primary channel and remove their channels
//!   while their elapsed counter is at or above `high`. The output is the intersection of both.
//! - Channels of active-low signals are inverted.
//! - The trailing reserved channels are high iff any other channel is high.
//!
//! A pulse only starts counting once the step index reaches its offset.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::config::CompilerConfig;
use crate::error::{CompileError, Result};
use crate::instruction::{Instruction, InstructionSequence};
use crate::quantize::{quantize_and_coarsen, QuantizedPulses};
use crate::signal::{Pulse, SignalSpec};
use crate::sync::minimum_duration_and_num_cycles;
use crate::utils::StageTimer;

/// Number of progress reports emitted over one simulation.
const PROGRESS_STEPS: u64 = 100;

type ProgressFn<'a> = Box<dyn FnMut(u64, u64) + 'a>;

/// Builder for compiling signals into an [`InstructionSequence`].
///
/// ```
/// use pbcompiler_backend::compiler::SequenceCompiler;
/// use pbcompiler_backend::config::CompilerConfig;
/// use pbcompiler_backend::signal::SignalSpec;
///
/// let signals = [SignalSpec::new(10., [0]).unwrap()];
/// let mut reports = 0;
/// let seq = SequenceCompiler::new(CompilerConfig::default())
///     .with_progress(|_done, _total| reports += 1)
///     .compile(&signals, &[])
///     .unwrap();
/// assert_eq!(seq.total_duration(), 100_000_000);
/// assert!(reports > 0);
/// ```
pub struct SequenceCompiler<'a> {
    config: CompilerConfig,
    duration: Option<u64>,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> SequenceCompiler<'a> {
    pub fn new(config: CompilerConfig) -> Self {
        SequenceCompiler {
            config,
            duration: None,
            progress: None,
        }
    }

    /// Uses `duration` (ns) as the repeating duration instead of synchronizing the signals.
    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Registers an observer called with `(done, total)` simulated steps.
    pub fn with_progress<F: FnMut(u64, u64) + 'a>(mut self, progress: F) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compiles `signals`, gated by `masking_signals`, into a repeating program.
    ///
    /// Caller-owned signals are never modified: rescaled copies are built through
    /// [`SignalSpec::with_frequency`].
    pub fn compile(
        &mut self,
        signals: &[SignalSpec],
        masking_signals: &[SignalSpec],
    ) -> Result<InstructionSequence> {
        self.validate(signals, masking_signals)?;
        let config = &self.config;
        let mut timer = StageTimer::new();

        let sync = minimum_duration_and_num_cycles(signals, masking_signals, self.duration, config)?;
        let (primary_freqs, masking_freqs) = sync.split_frequencies(signals.len());
        let rescaled = rescale(signals, primary_freqs)?;
        let masking_rescaled = rescale(masking_signals, masking_freqs)?;
        timer.tick_log("synchronize");

        let quantized = quantize_and_coarsen(
            &rescaled,
            &masking_rescaled,
            config.min_instruction_len,
            sync.nr_cycles,
        )?;
        let nr_cycles = (sync.duration / quantized.min_instruction_len).saturating_sub(1);
        info!(
            gcd_cycles = quantized.gcd_cycles,
            min_instruction_len = quantized.min_instruction_len,
            nr_cycles,
            "pulses quantized"
        );
        timer.tick_log("quantize");

        // The simulation emits at most one instruction per step plus the branch
        let max_steps = self.config.unroll.max_steps as u64;
        if nr_cycles.saturating_add(1) > max_steps {
            return Err(CompileError::Synchronization(format!(
                "A repeating duration of {} ns in steps of {} ns needs {} instructions, more than the limit of {}",
                sync.duration,
                quantized.min_instruction_len,
                nr_cycles.saturating_add(1),
                max_steps
            )));
        }

        let mut instructions = self.simulate(&quantized, nr_cycles, signals);
        instructions.push(Instruction::new_branch(
            all_channels_off(signals, self.config.nr_channels, self.config.reserved_channels),
            quantized.min_instruction_len,
            0,
        ));
        info!(nr_instructions = instructions.len(), "sequence compiled");
        timer.tick_log("simulate");

        InstructionSequence::with_limits(instructions, self.config.nr_channels, self.config.unroll)
    }

    fn validate(&self, signals: &[SignalSpec], masking_signals: &[SignalSpec]) -> Result<()> {
        if signals.is_empty() {
            return Err(CompileError::InvalidSignal(
                "At least one signal must be provided".to_string(),
            ));
        }
        self.config.validate()?;

        let signal_channels = union_of_channels(signals);
        let masking_channels = union_of_channels(masking_signals);
        let highest = signal_channels.union(&masking_channels).max().copied();
        match (highest, self.config.max_controllable_channel()) {
            (Some(highest), Some(max)) if highest <= max => {}
            (Some(highest), max) => {
                return Err(CompileError::Topology(format!(
                    "Signal channels exceed the configured controllable range 0..{}. Got channel {}.",
                    max.map_or(-1, |m| m as i64),
                    highest
                )))
            }
            (None, _) => {}
        }

        let invalid: Vec<usize> = masking_channels
            .difference(&signal_channels)
            .copied()
            .collect();
        if !invalid.is_empty() {
            return Err(CompileError::Topology(format!(
                "Masking channels must be a subset of signal channels. Invalid masking channels: {:?}",
                invalid
            )));
        }
        Ok(())
    }

    /// Simulates `nr_cycles` steps and run-length merges identical channel states.
    fn simulate(
        &mut self,
        quantized: &QuantizedPulses,
        nr_cycles: u64,
        signals: &[SignalSpec],
    ) -> Vec<Instruction> {
        let nr_channels = self.config.nr_channels;
        let reserved = self.config.reserved_channels;
        let quantum = quantized.min_instruction_len;

        let mut primary = PulseState::new(&quantized.pulses);
        let mut masking = PulseState::new(&quantized.masking_pulses);
        let primary_channels = primary.channel_union();
        let active_low = active_low_mask(signals);

        let report_every = (nr_cycles / PROGRESS_STEPS).max(1);
        let mut instructions: Vec<Instruction> = Vec::new();
        for cycle in 0..nr_cycles {
            let active = primary.step_active(cycle);
            let masked = masking.step_masked(cycle, primary_channels);
            let flags = set_reserved_channels((active & masked) ^ active_low, nr_channels, reserved);

            match instructions.last_mut() {
                Some(last) if last.flags == flags => last.duration += quantum,
                _ => instructions.push(Instruction::new_continue(flags, quantum)),
            }

            if (cycle + 1) % report_every == 0 || cycle + 1 == nr_cycles {
                if let Some(progress) = self.progress.as_mut() {
                    progress(cycle + 1, nr_cycles);
                }
            }
        }
        instructions
    }
}

/// Per-pulse elapsed counters during the simulation.
struct PulseState<'p> {
    pulses: &'p [Pulse],
    masks: Vec<u64>,
    elapsed: Vec<u64>,
}

impl<'p> PulseState<'p> {
    fn new(pulses: &'p [Pulse]) -> Self {
        PulseState {
            pulses,
            masks: pulses.iter().map(|p| channel_mask(&p.channels)).collect(),
            elapsed: vec![0; pulses.len()],
        }
    }

    fn channel_union(&self) -> u64 {
        self.masks.iter().fold(0, |acc, mask| acc | mask)
    }

    /// Visits every pulse that has started, passing whether it is in its high phase, then
    /// advances its counter.
    fn step<F: FnMut(bool, u64)>(&mut self, cycle: u64, mut visit: F) {
        for (idx, pulse) in self.pulses.iter().enumerate() {
            if cycle < pulse.offset {
                continue;
            }
            visit(self.elapsed[idx] < pulse.high, self.masks[idx]);
            self.elapsed[idx] = (self.elapsed[idx] + 1) % pulse.period;
        }
    }

    fn step_active(&mut self, cycle: u64) -> u64 {
        let mut active = 0;
        self.step(cycle, |high, mask| {
            if high {
                active |= mask;
            }
        });
        active
    }

    fn step_masked(&mut self, cycle: u64, base: u64) -> u64 {
        let mut masked = base;
        self.step(cycle, |high, mask| {
            if !high {
                masked &= !mask;
            }
        });
        masked
    }
}

fn rescale(signals: &[SignalSpec], frequencies: &[f64]) -> Result<Vec<SignalSpec>> {
    signals
        .iter()
        .zip(frequencies)
        .map(|(signal, &frequency)| signal.with_frequency(frequency))
        .collect()
}

fn union_of_channels(signals: &[SignalSpec]) -> BTreeSet<usize> {
    signals
        .iter()
        .flat_map(|signal| signal.channels().iter().copied())
        .collect()
}

fn channel_mask(channels: &BTreeSet<usize>) -> u64 {
    channels.iter().fold(0, |acc, &chan| acc | 1 << chan)
}

fn active_low_mask(signals: &[SignalSpec]) -> u64 {
    signals
        .iter()
        .filter(|signal| !signal.active_high())
        .fold(0, |acc, signal| acc | channel_mask(signal.channels()))
}

fn width_mask(nr_bits: usize) -> u64 {
    if nr_bits >= 64 {
        u64::MAX
    } else {
        (1 << nr_bits) - 1
    }
}

/// Sets the trailing `reserved_channels` bits of `flags` iff any lower bit is set, clearing
/// them otherwise.
///
/// ```
/// use pbcompiler_backend::compiler::set_reserved_channels;
/// assert_eq!(set_reserved_channels(0b0001, 4, 2), 0b1101);
/// assert_eq!(set_reserved_channels(0b1100, 4, 2), 0b0000);
/// ```
pub fn set_reserved_channels(flags: u64, nr_channels: usize, reserved_channels: usize) -> u64 {
    let controllable = width_mask(nr_channels.saturating_sub(reserved_channels));
    let reserved = width_mask(nr_channels) & !controllable;
    if flags & controllable != 0 {
        flags | reserved
    } else {
        flags & !reserved
    }
}

/// Flags with every signal off: channels of active-low signals high, everything else low apart
/// from the reserved channels, which follow [`set_reserved_channels`].
pub fn all_channels_off(signals: &[SignalSpec], nr_channels: usize, reserved_channels: usize) -> u64 {
    set_reserved_channels(active_low_mask(signals), nr_channels, reserved_channels)
}

/// Compiles repeating pulses with `config`, reporting progress through `tracing`.
///
/// ```
/// use pbcompiler_backend::compiler::generate_repeating_pulses;
/// use pbcompiler_backend::config::CompilerConfig;
/// use pbcompiler_backend::signal::SignalSpec;
///
/// let signals = [SignalSpec::new(10., [0]).unwrap(), SignalSpec::new(20., [1]).unwrap()];
/// let seq = generate_repeating_pulses(&signals, &[], &CompilerConfig::default()).unwrap();
/// assert_eq!(seq.total_duration(), 100_000_000);
/// ```
pub fn generate_repeating_pulses(
    signals: &[SignalSpec],
    masking_signals: &[SignalSpec],
    config: &CompilerConfig,
) -> Result<InstructionSequence> {
    SequenceCompiler::new(config.clone())
        .with_progress(|done, total| debug!(done, total, "instruction cycles"))
        .compile(signals, masking_signals)
}
