//! Error type shared by every stage of the compiler.
//!
//! All failures are raised synchronously at the point of detection and never downgraded to a
//! partial program. The variants follow the stage that detects them:
//!
//! - [`CompileError::InvalidSignal`]: a [`SignalSpec`] could not be constructed.
//! - [`CompileError::Synchronization`]: no common repeating duration fits under the ceiling.
//! - [`CompileError::Topology`]: channel numbering or channel-count configuration is inconsistent.
//! - [`CompileError::ControlFlow`]: the unroller met an ill-formed loop/subroutine/branch structure.
//! - [`CompileError::Parse`]: a line of PulseBlaster assembly could not be compiled.
//!
//! [`SignalSpec`]: crate::signal::SignalSpec

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("synchronization failed: {0}")]
    Synchronization(String),

    #[error("invalid channel topology: {0}")]
    Topology(String),

    #[error("invalid control flow at address {address}: {message}")]
    ControlFlow { address: usize, message: String },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl CompileError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        CompileError::Parse {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn control_flow(address: usize, message: impl Into<String>) -> Self {
        CompileError::ControlFlow {
            address,
            message: message.into(),
        }
    }

    /// Source line the error refers to, if it was raised while assembling text.
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::Parse { line, .. } => Some(*line),
            _ => None,
        }
    }
}
