use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Failures of the PulseBlaster driver boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    /// A board call returned a failure code. `message` is the board's last error string.
    #[error("Failed to {action} (code {code}): {message}")]
    Call {
        action: String,
        code: i32,
        message: String,
    },

    /// An instruction cannot be represented on the board.
    #[error("instruction {address}: {message}")]
    Program { address: usize, message: String },

    #[error("clock frequency must be positive, got {0} MHz")]
    Clock(f64),
}
