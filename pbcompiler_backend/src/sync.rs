//! Frequency synchronization: finds one repeating duration in which every signal completes an
//! integer number of periods, and rescales the signal frequencies to fit it exactly.
//!
//! Two strategies are used, chosen by [`minimum_duration_and_num_cycles`]:
//!
//! 1. **Integer multiples.** If, after rounding to `n_digits` decimal digits, the greatest common
//!    divisor of all frequencies is itself one of the frequencies, every signal is an integer
//!    multiple of the slowest one. The slowest period is then long enough for all of them, and
//!    faster signals are snapped to integer sub-multiples of it.
//! 2. **Least common multiple.** Otherwise every period is rounded onto a coarse grid of
//!    `n_round` time quanta and the duration is their least common multiple, which must stay
//!    below the `t_max` ceiling since the program length is bounded by the board's memory.

use tracing::{debug, info};

use crate::config::CompilerConfig;
use crate::error::{CompileError, Result};
use crate::signal::SignalSpec;
use crate::utils::*;

/// Outcome of frequency synchronization.
#[derive(Debug, Clone, PartialEq)]
pub struct Synchronized {
    /// Repeating duration in ns.
    pub duration: u64,
    /// Number of `min_instruction_len` cycles in `duration`.
    pub nr_cycles: u64,
    /// Rescaled frequency of every signal: primary signals first, then masking signals.
    pub frequencies: Vec<f64>,
}

impl Synchronized {
    /// Splits the rescaled frequencies into (primary, masking).
    pub fn split_frequencies(&self, nr_primary: usize) -> (&[f64], &[f64]) {
        self.frequencies.split_at(nr_primary)
    }
}

/// Calculates the repeating duration of a signal set and the number of instruction cycles it
/// spans.
///
/// # Arguments
/// - `signals`, `masking_signals`: the signals to fit into one repeating duration.
/// - `duration`: caller-supplied duration in ns. When given it is used as-is and the frequencies
///   are returned unchanged.
/// - `config`: supplies the quantum `min_instruction_len`, the rounding parameters `n_round` and
///   `n_digits`, and the ceiling `t_max`.
///
/// # Examples
/// ```
/// use pbcompiler_backend::config::CompilerConfig;
/// use pbcompiler_backend::signal::SignalSpec;
/// use pbcompiler_backend::sync::minimum_duration_and_num_cycles;
///
/// let signals = [SignalSpec::new(10., [0]).unwrap(), SignalSpec::new(20., [1]).unwrap()];
/// let sync = minimum_duration_and_num_cycles(&signals, &[], None, &CompilerConfig::default()).unwrap();
/// assert_eq!(sync.duration, 100_000_000);
/// assert_eq!(sync.nr_cycles, 5_000_000);
/// assert_eq!(sync.frequencies, vec![10., 20.]);
/// ```
pub fn minimum_duration_and_num_cycles(
    signals: &[SignalSpec],
    masking_signals: &[SignalSpec],
    duration: Option<u64>,
    config: &CompilerConfig,
) -> Result<Synchronized> {
    let quantum = config.min_instruction_len;
    let frequencies: Vec<f64> = signals
        .iter()
        .chain(masking_signals.iter())
        .map(|signal| signal.frequency())
        .collect();
    if frequencies.is_empty() {
        return Err(CompileError::Synchronization(
            "no signals to synchronize".to_string(),
        ));
    }

    let (duration, frequencies) = match duration {
        Some(duration) => {
            if duration < quantum {
                return Err(CompileError::Synchronization(format!(
                    "duration {} ns is shorter than the minimum instruction length {} ns",
                    duration, quantum
                )));
            }
            (duration, frequencies)
        }
        None => {
            let scale = 10f64.powi(config.n_digits as i32);
            let rounded: Vec<u64> = frequencies.iter().map(|f| round_u64(f * scale)).collect();
            let gcd_freqs = gcd_all(rounded.iter().copied());
            if rounded.contains(&gcd_freqs) {
                sync_integer_multiples(&frequencies, config)?
            } else {
                sync_least_common_multiple(&frequencies, config)?
            }
        }
    };

    let nr_cycles = duration / quantum;
    debug!(duration, nr_cycles, ?frequencies, "signals synchronized");
    Ok(Synchronized {
        duration,
        nr_cycles,
        frequencies,
    })
}

fn sync_integer_multiples(frequencies: &[f64], config: &CompilerConfig) -> Result<(u64, Vec<f64>)> {
    let quantum = config.min_instruction_len;
    let ns_round = config.n_round * quantum;
    let fmin = frequencies.iter().copied().fold(f64::INFINITY, f64::min);

    let duration = round_to_nearest_n_ns(round_u64(1e9 / fmin), ns_round);
    if duration == 0 {
        return Err(CompileError::Synchronization(format!(
            "period of the slowest signal ({} Hz) rounds to 0 ns at a granularity of {} ns",
            fmin, ns_round
        )));
    }
    let rescaled = frequencies
        .iter()
        .map(|&f| {
            let period = round_to_nearest_n_ns(round_u64(duration as f64 / (f / fmin)), quantum);
            if period == 0 {
                return Err(CompileError::Synchronization(format!(
                    "period of {} Hz rounds to 0 ns at a granularity of {} ns",
                    f, quantum
                )));
            }
            Ok(1e9 / period as f64)
        })
        .collect::<Result<Vec<f64>>>()?;
    info!(duration, "frequencies are integer multiples of {} Hz", fmin);
    Ok((duration, rescaled))
}

fn sync_least_common_multiple(
    frequencies: &[f64],
    config: &CompilerConfig,
) -> Result<(u64, Vec<f64>)> {
    let quantum = config.min_instruction_len;
    let ns_round = config.n_round * quantum;
    let periods = frequencies
        .iter()
        .map(|&f| {
            let period = round_u64(1e9 / f);
            let period = round_to_nearest_n_ns(period - period % quantum, ns_round);
            if period == 0 {
                return Err(CompileError::Synchronization(format!(
                    "period of {} Hz rounds to 0 ns at a granularity of {} ns",
                    f, ns_round
                )));
            }
            Ok(period)
        })
        .collect::<Result<Vec<u64>>>()?;

    let lcm_periods = lcm_all(periods.iter().copied()).ok_or_else(|| {
        CompileError::Synchronization(format!(
            "lcm timespan of input periods {:?} ns overflows",
            periods
        ))
    })?;
    // Beyond the ceiling the sequence may exceed the board's program memory
    if lcm_periods >= config.t_max {
        return Err(CompileError::Synchronization(format!(
            "lcm timespan of input frequencies is too large, {:.1e} s",
            lcm_periods as f64 * 1e-9
        )));
    }
    info!(duration = lcm_periods, ?periods, "synchronized through least common multiple");
    Ok((
        lcm_periods,
        periods.iter().map(|&p| 1e9 / p as f64).collect(),
    ))
}
