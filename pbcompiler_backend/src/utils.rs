//! Integer arithmetic, rounding and timing helpers shared by the synchronizer, quantizer and
//! sequence compiler.
//!
//! ## Rounding policy
//! Every float-to-integer rounding in this crate rounds half to even ("banker's rounding").
//! Integer rounding to a multiple ([`round_to_nearest_n_ns`]) follows the same rule but is
//! computed exactly in integer arithmetic, so the generated program layout never depends on
//! platform float behavior for values that are already integral.

use std::time::Instant;

use tracing::debug;

/// Rounds half to even and converts to an unsigned integer.
///
/// Negative and NaN inputs saturate to 0, values beyond `u64::MAX` saturate to `u64::MAX`.
///
/// ```
/// use pbcompiler_backend::utils::round_u64;
/// assert_eq!(round_u64(2.5), 2);
/// assert_eq!(round_u64(3.5), 4);
/// assert_eq!(round_u64(2.6), 3);
/// ```
pub fn round_u64(value: f64) -> u64 {
    value.round_ties_even() as u64
}

/// Rounds `value` to the nearest integer multiple of `ns_round`, ties to the even multiple.
///
/// ```
/// use pbcompiler_backend::utils::round_to_nearest_n_ns;
/// assert_eq!(round_to_nearest_n_ns(149, 100), 100);
/// assert_eq!(round_to_nearest_n_ns(150, 100), 200);
/// assert_eq!(round_to_nearest_n_ns(250, 100), 200);
/// ```
pub fn round_to_nearest_n_ns(value: u64, ns_round: u64) -> u64 {
    debug_assert!(ns_round > 0, "Rounding granularity must be positive");
    let quotient = value / ns_round;
    let remainder = value % ns_round;
    let rounded = match (2 * remainder).cmp(&ns_round) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => quotient + (quotient & 1),
    };
    rounded * ns_round
}

/// Greatest common divisor, with `gcd(0, n) == n`.
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple, `None` on overflow. `lcm(0, n) == 0`.
pub fn lcm(a: u64, b: u64) -> Option<u64> {
    if a == 0 || b == 0 {
        return Some(0);
    }
    (a / gcd(a, b)).checked_mul(b)
}

/// Greatest common divisor of every value; 0 for an empty iterator.
pub fn gcd_all<I: IntoIterator<Item = u64>>(values: I) -> u64 {
    values.into_iter().fold(0, gcd)
}

/// Least common multiple of every value; `None` on overflow, 1 for an empty iterator.
pub fn lcm_all<I: IntoIterator<Item = u64>>(values: I) -> Option<u64> {
    values
        .into_iter()
        .try_fold(1u64, |acc, value| lcm(acc, value))
}

/// Measures the wall time spent in consecutive compilation stages.
pub struct StageTimer {
    last: Instant,
}

impl StageTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Returns the milliseconds elapsed since the previous tick and restarts the clock.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    /// Ticks and reports the elapsed time of `stage` at debug level.
    pub fn tick_log(&mut self, stage: &str) -> f64 {
        let diff = self.tick();
        debug!(stage, elapsed_ms = diff, "stage finished");
        diff
    }
}

impl Default for StageTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_round_to_even() {
        assert_eq!(round_u64(0.5), 0);
        assert_eq!(round_u64(1.5), 2);
        assert_eq!(round_u64(-3.0), 0);
        assert_eq!(round_to_nearest_n_ns(50, 100), 0);
        assert_eq!(round_to_nearest_n_ns(350, 100), 400);
        assert_eq!(round_to_nearest_n_ns(303_030_300, 100_000), 303_000_000);
    }

    #[test]
    fn gcd_and_lcm() {
        assert_eq!(gcd(0, 7), 7);
        assert_eq!(gcd_all([12, 18, 0, 30]), 6);
        assert_eq!(gcd_all(std::iter::empty()), 0);
        assert_eq!(lcm_all([4, 6, 10]), Some(60));
        assert_eq!(lcm(u64::MAX, u64::MAX - 1), None);
    }

    #[test]
    fn timer_is_monotonic() {
        let mut timer = StageTimer::new();
        assert!(timer.tick() >= 0.);
        assert!(timer.tick_log("noop") >= 0.);
    }
}
