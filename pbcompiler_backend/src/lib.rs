//! # PulseBlaster compiler backend
//!
//! Compiles periodic digital signals, and programs written in the PulseBlaster text format,
//! into instruction programs for a SpinCore PulseBlaster.
//!
//! Two front ends converge on [`InstructionSequence`]:
//! - [`generate_repeating_pulses`]: `SignalSpec[]` → frequency synchronization
//!   ([`sync`]) → quantization ([`quantize`]) → step simulation ([`compiler`]).
//! - [`code_to_instructions`]: text → [`assembler`].
//!
//! An [`InstructionSequence`] unrolls its loops and subroutines once at construction, which
//! both validates its control flow and provides the timeline used by the device driver
//! (`pbctrl_backend`) and by plotting code.
//!
//! ## Example
//! ```
//! use pbcompiler_backend::*;
//!
//! let signals = [
//!     SignalSpec::new(10., [0]).unwrap(),
//!     SignalSpec::build(20., [1], 0, 0.5, 0, false).unwrap(),
//! ];
//! let seq = generate_repeating_pulses(&signals, &[], &CompilerConfig::default()).unwrap();
//! assert_eq!(seq.total_duration(), 100_000_000);
//! assert_eq!(seq.branch_index(), Some(0));
//! ```

pub mod assembler;
pub mod compiler;
pub mod config;
pub mod error;
pub mod instruction;
pub mod quantize;
pub mod signal;
pub mod sync;
pub mod utils;

#[cfg(feature = "python")]
pub mod python;

pub use assembler::code_to_instructions;
pub use compiler::{generate_repeating_pulses, SequenceCompiler};
pub use config::{AssemblerConfig, CompilerConfig, UnrollLimits};
pub use error::{CompileError, Result};
pub use instruction::{Instruction, InstructionSequence, Opcode};
pub use signal::{Authority, Pulse, SignalSpec};
