//! Upload and run control of a SpinCore PulseBlaster.
//!
//! ## Overview
//!
//! [`PulseBoard`] lists the vendor library calls the driver needs, each returning the vendor's raw
//! `i32` code. [`PulseBlaster`] wraps one board behind safe methods that turn those codes into
//! [`DeviceError`]s through [`check_return_code`].
//!
//! ## Board selection
//!
//! The vendor library keeps the selected board as global state, so every board number shares one
//! [`PulseBoard`] behind an `Arc<Mutex<_>>`. Each operation locks it and selects its own board
//! before issuing calls; an upload keeps the lock for its whole duration.
//!
//! ## Cleanup
//!
//! - Programming happens inside a [`ProgrammingGuard`], which stops programming when dropped, so
//!   the board leaves programming mode even if writing an instruction fails.
//! - Dropping a [`PulseBlaster`] resets and closes its board. Failures during cleanup cannot be
//!   returned and are logged instead.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use pbcompiler_backend::InstructionSequence;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, Result};
use crate::program::{to_device_program, DeviceInstruction};

/// `start_programming` target selecting the pulse program memory.
pub const PULSE_PROGRAM: i32 = 0;

/// The vendor calls used by [`PulseBlaster`], with the vendor's return conventions.
pub trait PulseBoard {
    fn count_boards(&mut self) -> i32;
    fn select_board(&mut self, board_number: i32) -> i32;
    fn init(&mut self) -> i32;
    fn close(&mut self) -> i32;
    fn reset(&mut self) -> i32;
    fn core_clock(&mut self, clock_mhz: f64) -> i32;
    fn start_programming(&mut self, device: i32) -> i32;
    /// Writes one instruction, returning its address on success.
    fn inst_pbonly(&mut self, flags: u32, opcode: i32, inst_data: i32, length_ns: f64) -> i32;
    fn stop_programming(&mut self) -> i32;
    fn start(&mut self) -> i32;
    fn stop(&mut self) -> i32;
    /// Status bits, see [`BoardStatus`].
    fn read_status(&mut self) -> i32;
    /// Description of the most recent failure.
    fn last_error(&mut self) -> String;
    /// Firmware ID of the selected board.
    fn firmware_id(&mut self) -> i32;
    /// Version string of the vendor library.
    fn version(&mut self) -> String;
}

/// How a call reports success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Success {
    /// Only 0 is success.
    Zero,
    /// Any non-negative value is success, e.g. a written address.
    NonNegative,
}

/// Turns a vendor return code into a [`Result`], fetching the board's error string on failure.
pub fn check_return_code<B: PulseBoard + ?Sized>(
    board: &mut B,
    code: i32,
    action: &str,
    success: Success,
) -> Result<i32> {
    let failed = match success {
        Success::Zero => code != 0,
        Success::NonNegative => code < 0,
    };
    if failed {
        return Err(DeviceError::Call {
            action: action.to_string(),
            code,
            message: board.last_error(),
        });
    }
    Ok(code)
}

/// Decoded status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoardStatus {
    pub stopped: bool,
    pub reset: bool,
    pub running: bool,
    pub waiting: bool,
}

impl BoardStatus {
    /// Decodes bits 0 to 3: stopped, reset, running, waiting.
    pub fn from_bits(bits: u32) -> Self {
        BoardStatus {
            stopped: bits & 0b0001 != 0,
            reset: bits & 0b0010 != 0,
            running: bits & 0b0100 != 0,
            waiting: bits & 0b1000 != 0,
        }
    }
}

/// Number of boards the vendor library can see.
pub fn number_of_boards_connected<B: PulseBoard + ?Sized>(board: &mut B) -> Result<usize> {
    let code = board.count_boards();
    let count = check_return_code(board, code, "count PulseBlaster boards", Success::NonNegative)?;
    Ok(count as usize)
}

/// An open PulseBlaster board.
pub struct PulseBlaster<B: PulseBoard> {
    board: Arc<Mutex<B>>,
    board_number: i32,
    clock_mhz: f64,
}

impl<B: PulseBoard> PulseBlaster<B> {
    /// Selects and initializes board `board_number`, clocked at `clock_mhz`.
    pub fn open(board: Arc<Mutex<B>>, board_number: i32, clock_mhz: f64) -> Result<Self> {
        if !(clock_mhz.is_finite() && clock_mhz > 0.) {
            return Err(DeviceError::Clock(clock_mhz));
        }
        {
            let mut guard = board.lock();
            select(&mut *guard, board_number)?;
            let code = guard.init();
            check_return_code(
                &mut *guard,
                code,
                &format!("initialize PulseBlaster board {}", board_number),
                Success::Zero,
            )?;
        }
        info!(board_number, clock_mhz, "PulseBlaster opened");
        Ok(PulseBlaster {
            board,
            board_number,
            clock_mhz,
        })
    }

    pub fn board_number(&self) -> i32 {
        self.board_number
    }

    /// Core clock in MHz.
    pub fn clock(&self) -> f64 {
        self.clock_mhz
    }

    /// Locks the shared board and selects this board number.
    fn acquire(&self) -> Result<MutexGuard<'_, B>> {
        let mut guard = self.board.lock();
        select(&mut *guard, self.board_number)?;
        Ok(guard)
    }

    fn call<F: FnOnce(&mut B) -> i32>(&self, action: &str, f: F) -> Result<i32> {
        let mut guard = self.acquire()?;
        let code = f(&mut *guard);
        check_return_code(&mut *guard, code, action, Success::Zero)
    }

    /// Uploads `seq`, returning the number of instructions written.
    ///
    /// The sequence is converted before the board is touched, so an unrepresentable program
    /// leaves the board as it was.
    pub fn program(&self, seq: &InstructionSequence) -> Result<usize> {
        let program = to_device_program(seq, self.clock_mhz)?;
        let mut guard = self.acquire()?;

        let code = guard.reset();
        check_return_code(&mut *guard, code, "reset PulseBlaster board", Success::Zero)?;
        let code = guard.core_clock(self.clock_mhz);
        check_return_code(
            &mut *guard,
            code,
            &format!("set core clock to {} MHz", self.clock_mhz),
            Success::Zero,
        )?;
        let code = guard.start_programming(PULSE_PROGRAM);
        check_return_code(&mut *guard, code, "start pulse programming", Success::Zero)?;

        let mut session = ProgrammingGuard {
            board: guard,
            finished: false,
        };
        for (address, instruction) in program.iter().enumerate() {
            session.write(address, instruction, self.clock_mhz)?;
        }
        session.finish()?;
        info!(
            board_number = self.board_number,
            nr_instructions = program.len(),
            "program uploaded"
        );
        Ok(program.len())
    }

    pub fn start(&self) -> Result<()> {
        self.call("start PulseBlaster execution", |b| b.start())?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.call("stop PulseBlaster execution", |b| b.stop())?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.call("reset PulseBlaster board", |b| b.reset())?;
        Ok(())
    }

    pub fn status(&self) -> Result<BoardStatus> {
        let mut guard = self.acquire()?;
        let code = guard.read_status();
        let bits = check_return_code(&mut *guard, code, "read status", Success::NonNegative)?;
        Ok(BoardStatus::from_bits(bits as u32))
    }

    pub fn firmware_id(&self) -> Result<i32> {
        let mut guard = self.acquire()?;
        let code = guard.firmware_id();
        check_return_code(&mut *guard, code, "read firmware ID", Success::NonNegative)
    }

    /// Version of the vendor library driving the board.
    pub fn version(&self) -> String {
        self.board.lock().version()
    }

    /// Most recent error string reported by the board.
    pub fn error(&self) -> String {
        self.board.lock().last_error()
    }
}

impl<B: PulseBoard> Drop for PulseBlaster<B> {
    fn drop(&mut self) {
        let mut guard = self.board.lock();
        let codes = [
            ("select", guard.select_board(self.board_number)),
            ("reset", guard.reset()),
            ("close", guard.close()),
        ];
        for (action, code) in codes {
            if code != 0 {
                warn!(board_number = self.board_number, action, code, "PulseBlaster cleanup failed");
            }
        }
        debug!(board_number = self.board_number, "PulseBlaster closed");
    }
}

fn select<B: PulseBoard + ?Sized>(board: &mut B, board_number: i32) -> Result<()> {
    let code = board.select_board(board_number);
    check_return_code(
        board,
        code,
        &format!("select PulseBlaster board {}", board_number),
        Success::Zero,
    )?;
    Ok(())
}

/// An open programming session. Stops programming when dropped unless
/// [`finish`](Self::finish) already did.
pub struct ProgrammingGuard<'a, B: PulseBoard> {
    board: MutexGuard<'a, B>,
    finished: bool,
}

impl<'a, B: PulseBoard> ProgrammingGuard<'a, B> {
    fn write(&mut self, address: usize, instruction: &DeviceInstruction, clock_mhz: f64) -> Result<()> {
        let code = self.board.inst_pbonly(
            instruction.flags,
            instruction.opcode.code(),
            instruction.inst_data,
            instruction.length_ns(clock_mhz),
        );
        check_return_code(
            &mut *self.board,
            code,
            &format!("write instruction {}", address),
            Success::NonNegative,
        )?;
        Ok(())
    }

    /// Stops programming, reporting a failure to do so.
    fn finish(mut self) -> Result<()> {
        self.finished = true;
        let code = self.board.stop_programming();
        check_return_code(&mut *self.board, code, "stop pulse programming", Success::Zero)?;
        Ok(())
    }
}

impl<'a, B: PulseBoard> Drop for ProgrammingGuard<'a, B> {
    fn drop(&mut self) {
        if !self.finished {
            let code = self.board.stop_programming();
            if code != 0 {
                warn!(code, "failed to stop pulse programming");
            }
        }
    }
}
