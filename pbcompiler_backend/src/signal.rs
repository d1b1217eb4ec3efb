//! Periodic signal descriptions, in continuous time ([`SignalSpec`]) and in units of the time
//! quantum ([`Pulse`]).
//!
//! A [`SignalSpec`] is validated once at construction and is immutable afterwards. Exactly one of
//! the high time and the duty cycle is authoritative, see [`Authority`]; rescaling the frequency
//! through [`SignalSpec::with_frequency`] keeps the authoritative quantity and re-derives the
//! other one.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{CompileError, Result};

/// Which of the high time and the duty cycle a [`SignalSpec`] was defined by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// High time was left unset and derived from the duty cycle. Rescaling the frequency keeps
    /// the duty cycle and recomputes the high time.
    DutyCycle,
    /// High time was given in ns. Rescaling the frequency keeps the absolute high time.
    HighTime,
}

/// Validated description of one periodic binary waveform.
///
/// # Fields
/// - `frequency`: frequency in Hz, positive and finite.
/// - `channels`: output channels driven by the signal, non-empty.
/// - `offset`: delay from the program start in ns.
/// - `duty_cycle`: fraction of the period spent high, within `[0, 1]`.
/// - `high`: time spent high in ns, strictly less than the period.
/// - `active_high`: `false` for signals whose "on" state is a low output.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSpec {
    frequency: f64,
    channels: BTreeSet<usize>,
    offset: u64,
    duty_cycle: f64,
    high: u64,
    active_high: bool,
    authority: Authority,
}

impl SignalSpec {
    /// Constructs an active-high signal with a 50% duty cycle and no offset.
    ///
    /// ```
    /// use pbcompiler_backend::signal::*;
    ///
    /// let signal = SignalSpec::new(10., [0, 1]).unwrap();
    /// assert_eq!(signal.high(), 50_000_000);
    /// assert_eq!(signal.authority(), Authority::DutyCycle);
    ///
    /// assert!(SignalSpec::new(-1., [0]).is_err());
    /// assert!(SignalSpec::new(10., Vec::<usize>::new()).is_err());
    /// ```
    pub fn new<I: IntoIterator<Item = usize>>(frequency: f64, channels: I) -> Result<Self> {
        Self::build(frequency, channels, 0, 0.5, 0, true)
    }

    /// Constructs a signal from every field.
    ///
    /// A `high` of 0 means "unset": the high time is derived from `duty_cycle` (truncated to
    /// whole ns) and the duty cycle becomes authoritative. Any other `high` is authoritative
    /// and `duty_cycle` is derived from it.
    ///
    /// ```
    /// use pbcompiler_backend::signal::*;
    ///
    /// let signal = SignalSpec::build(1e3, [2], 100, 0.5, 250_000, false).unwrap();
    /// assert_eq!(signal.duty_cycle(), 0.25);
    /// assert_eq!(signal.authority(), Authority::HighTime);
    ///
    /// // High time must be strictly shorter than the 1 ms period
    /// assert!(SignalSpec::build(1e3, [2], 0, 0.5, 1_000_000, true).is_err());
    /// ```
    pub fn build<I: IntoIterator<Item = usize>>(
        frequency: f64,
        channels: I,
        offset: u64,
        duty_cycle: f64,
        high: u64,
        active_high: bool,
    ) -> Result<Self> {
        if !(frequency.is_finite() && frequency > 0.) {
            return Err(CompileError::InvalidSignal(format!(
                "Frequency must be positive, got {}",
                frequency
            )));
        }
        if !(0. ..=1.).contains(&duty_cycle) {
            return Err(CompileError::InvalidSignal(format!(
                "Duty cycle must be between 0 and 1, got {}",
                duty_cycle
            )));
        }
        let channels: BTreeSet<usize> = channels.into_iter().collect();
        if channels.is_empty() {
            return Err(CompileError::InvalidSignal(
                "At least one channel must be specified".to_string(),
            ));
        }

        let period = 1e9 / frequency;
        let (high, duty_cycle, authority) = if high == 0 {
            ((period * duty_cycle) as u64, duty_cycle, Authority::DutyCycle)
        } else {
            (high, high as f64 / period, Authority::HighTime)
        };
        check_high_below_period(high, period)?;

        Ok(SignalSpec {
            frequency,
            channels,
            offset,
            duty_cycle,
            high,
            active_high,
            authority,
        })
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }
    pub fn channels(&self) -> &BTreeSet<usize> {
        &self.channels
    }
    pub fn offset(&self) -> u64 {
        self.offset
    }
    pub fn duty_cycle(&self) -> f64 {
        self.duty_cycle
    }
    pub fn high(&self) -> u64 {
        self.high
    }
    pub fn active_high(&self) -> bool {
        self.active_high
    }
    pub fn authority(&self) -> Authority {
        self.authority
    }
    /// Period in ns, `1e9 / frequency`.
    pub fn period(&self) -> f64 {
        1e9 / self.frequency
    }

    /// Returns a copy of this signal running at `frequency`.
    ///
    /// The authoritative quantity survives the change: a duty-cycle signal gets a high time
    /// recomputed from the new period, a high-time signal keeps its absolute high time (and
    /// fails if that no longer fits in the new period).
    pub fn with_frequency(&self, frequency: f64) -> Result<Self> {
        if !(frequency.is_finite() && frequency > 0.) {
            return Err(CompileError::InvalidSignal(format!(
                "Frequency must be positive, got {}",
                frequency
            )));
        }
        let period = 1e9 / frequency;
        let (high, duty_cycle) = match self.authority {
            Authority::DutyCycle => ((period * self.duty_cycle) as u64, self.duty_cycle),
            Authority::HighTime => (self.high, self.high as f64 / period),
        };
        check_high_below_period(high, period)?;
        Ok(SignalSpec {
            frequency,
            high,
            duty_cycle,
            ..self.clone()
        })
    }
}

fn check_high_below_period(high: u64, period: f64) -> Result<()> {
    if high as f64 >= period {
        return Err(CompileError::InvalidSignal(format!(
            "Pulse high {} ns >= period {:.0} ns",
            high, period
        )));
    }
    Ok(())
}

impl fmt::Display for SignalSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Signal({} Hz, channels {:?}, offset {} ns, high {} ns, {})",
            self.frequency,
            self.channels,
            self.offset,
            self.high,
            if self.active_high { "active high" } else { "active low" }
        )
    }
}

/// A signal expressed in integer counts of the current time quantum.
///
/// Produced by [`quantize_signals`](crate::quantize::quantize_signals); the only later mutation
/// is [`Pulse::coarsen`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulse {
    pub period: u64,
    pub offset: u64,
    pub high: u64,
    pub channels: BTreeSet<usize>,
    pub active_high: bool,
}

impl Pulse {
    /// Divides period, offset and high by `factor`, which must divide all three.
    pub fn coarsen(&mut self, factor: u64) {
        debug_assert!(
            factor > 0
                && self.period % factor == 0
                && self.offset % factor == 0
                && self.high % factor == 0,
            "Coarsening factor {} does not divide pulse {:?}",
            factor,
            self
        );
        self.period /= factor;
        self.offset /= factor;
        self.high /= factor;
    }
}

impl fmt::Display for Pulse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Pulse(period {}, offset {}, high {}, channels {:?})",
            self.period, self.offset, self.high, self.channels
        )
    }
}
