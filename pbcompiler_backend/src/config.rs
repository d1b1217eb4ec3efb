//! Compiler and assembler configuration.
//!
//! Every numeric knob of the compiler is a field here and is threaded explicitly through the
//! synchronizer, quantizer, sequence compiler and unroller. Defaults match a 24-flag
//! PulseBlaster with a 20 ns minimum instruction length, whose three most significant flag bits
//! are not separately controllable.

use crate::error::{CompileError, Result};

/// Widest flag word an [`Instruction`](crate::instruction::Instruction) bitmask can hold.
pub const MAX_CHANNELS: usize = 64;

/// Bounds applied by the unroller so that a program without a reachable STOP or BRANCH is
/// reported instead of iterated forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrollLimits {
    /// Maximum number of flattened steps recorded before unrolling is aborted. The sequence
    /// compiler also refuses to simulate a program with more steps than this.
    pub max_steps: usize,
    /// Maximum depth of both the subroutine stack and the loop stack.
    pub max_depth: usize,
}

impl Default for UnrollLimits {
    fn default() -> Self {
        Self {
            max_steps: 10_000_000,
            // Nesting depth supported by the PulseBlaster program memory controller
            max_depth: 8,
        }
    }
}

/// Parameters of [`generate_repeating_pulses`](crate::compiler::generate_repeating_pulses).
///
/// # Fields
/// - `min_instruction_len`: smallest instruction length (time quantum) in ns.
/// - `nr_channels`: number of flag bits in each instruction.
/// - `reserved_channels`: number of trailing flag bits that mirror whether any other flag is on.
/// - `n_round`: periods are rounded to the nearest multiple of `n_round * min_instruction_len` ns.
/// - `n_digits`: number of decimal digits kept when checking whether all frequencies are integer
///   multiples of the slowest one.
/// - `t_max`: ceiling (ns) on the repeating duration found through a least common multiple.
/// - `unroll`: bounds for unrolling the generated program.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerConfig {
    pub min_instruction_len: u64,
    pub nr_channels: usize,
    pub reserved_channels: usize,
    pub n_round: u64,
    pub n_digits: u32,
    pub t_max: u64,
    pub unroll: UnrollLimits,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            min_instruction_len: 20,
            nr_channels: 24,
            reserved_channels: 3,
            n_round: 5_000,
            n_digits: 4,
            t_max: 10_000_000_000,
            unroll: UnrollLimits::default(),
        }
    }
}

impl CompilerConfig {
    pub fn with_min_instruction_len(mut self, min_instruction_len: u64) -> Self {
        self.min_instruction_len = min_instruction_len;
        self
    }

    pub fn with_channels(mut self, nr_channels: usize, reserved_channels: usize) -> Self {
        self.nr_channels = nr_channels;
        self.reserved_channels = reserved_channels;
        self
    }

    pub fn with_rounding(mut self, n_round: u64, n_digits: u32) -> Self {
        self.n_round = n_round;
        self.n_digits = n_digits;
        self
    }

    pub fn with_t_max(mut self, t_max: u64) -> Self {
        self.t_max = t_max;
        self
    }

    pub fn with_unroll_limits(mut self, unroll: UnrollLimits) -> Self {
        self.unroll = unroll;
        self
    }

    /// Highest channel index that signals may drive.
    pub fn max_controllable_channel(&self) -> Option<usize> {
        self.nr_channels
            .checked_sub(self.reserved_channels)?
            .checked_sub(1)
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.min_instruction_len == 0 {
            return Err(CompileError::Topology(format!(
                "min_instruction_len must be positive, got {}",
                self.min_instruction_len
            )));
        }
        validate_channel_count(self.nr_channels)?;
        if self.reserved_channels >= self.nr_channels {
            return Err(CompileError::Topology(format!(
                "reserved_channels ({}) must be less than nr_channels ({})",
                self.reserved_channels, self.nr_channels
            )));
        }
        if self.n_round == 0 {
            return Err(CompileError::Synchronization(
                "rounding granularity n_round must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters of [`code_to_instructions`](crate::assembler::code_to_instructions).
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblerConfig {
    /// Number of flag bits in each instruction.
    pub nr_flags: usize,
    pub unroll: UnrollLimits,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            nr_flags: 24,
            unroll: UnrollLimits::default(),
        }
    }
}

impl AssemblerConfig {
    pub fn with_nr_flags(mut self, nr_flags: usize) -> Self {
        self.nr_flags = nr_flags;
        self
    }
}

pub(crate) fn validate_channel_count(nr_channels: usize) -> Result<()> {
    if nr_channels == 0 || nr_channels > MAX_CHANNELS {
        return Err(CompileError::Topology(format!(
            "nr_channels must be positive and at most {}, got {}",
            MAX_CHANNELS, nr_channels
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CompilerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_controllable_channel(), Some(20));
    }

    #[test]
    fn rejects_inconsistent_channels() {
        let zero_quantum = CompilerConfig::default().with_min_instruction_len(0);
        assert!(matches!(zero_quantum.validate(), Err(CompileError::Topology(_))));

        let all_reserved = CompilerConfig::default().with_channels(4, 4);
        let err = all_reserved.validate().unwrap_err();
        assert!(err.to_string().contains("reserved_channels"));

        let too_wide = CompilerConfig::default().with_channels(65, 3);
        assert!(matches!(too_wide.validate(), Err(CompileError::Topology(_))));
        let empty = CompilerConfig::default().with_channels(0, 0);
        assert!(matches!(empty.validate(), Err(CompileError::Topology(_))));
    }
}
