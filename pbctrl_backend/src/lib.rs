//! # PulseBlaster control backend
//!
//! Uploads programs compiled by `pbcompiler_backend` to SpinCore PulseBlaster boards and controls
//! their execution.
//!
//! - [`board`]: the [`PulseBoard`] call interface, [`PulseBlaster`] handles and their cleanup.
//! - [`program`]: conversion of an `InstructionSequence` into board instructions.
//! - [`error`]: [`DeviceError`].
//!
//! ## Example
//! ```ignore
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use pbcompiler_backend::*;
//! use pbctrl_backend::*;
//!
//! let board = Arc::new(Mutex::new(SpinApi::new())); // any `PulseBoard` implementation
//! let pb = PulseBlaster::open(board, 0, 250.)?;
//! let seq = generate_repeating_pulses(&[SignalSpec::new(10., [0])?], &[], &CompilerConfig::default())?;
//! pb.program(&seq)?;
//! pb.start()?;
//! ```

pub mod board;
pub mod error;
pub mod program;

pub use board::{
    check_return_code, number_of_boards_connected, BoardStatus, PulseBlaster, PulseBoard, Success,
};
pub use error::{DeviceError, Result};
pub use program::{to_device_program, DeviceInstruction};
