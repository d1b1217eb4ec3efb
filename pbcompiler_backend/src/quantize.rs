//! Conversion of synchronized signals into [`Pulse`]s counted in time quanta, and coarsening of
//! the quantum by the greatest common divisor of all counts.
//!
//! Coarsening never changes the generated waveform. It only lengthens the time step, so the
//! sequence compiler has fewer cycles to simulate and emits run lengths in larger units.

use tracing::debug;

use crate::error::{CompileError, Result};
use crate::signal::{Authority, Pulse, SignalSpec};
use crate::utils::*;

/// Converts signals to pulses in units of `min_instruction_len`.
///
/// Returns the pulses together with the cycle counts that must stay integral under
/// coarsening: every period and high count, plus every nonzero offset.
///
/// A duty-cycle signal derives its high count from its quantized period, a high-time signal
/// from its absolute high time.
pub fn quantize_signals(
    signals: &[SignalSpec],
    min_instruction_len: u64,
) -> Result<(Vec<Pulse>, Vec<u64>)> {
    let quantum = min_instruction_len as f64;
    let mut pulses = Vec::with_capacity(signals.len());
    let mut instruction_cycles = Vec::with_capacity(3 * signals.len());
    for signal in signals {
        let period = round_u64(signal.period() / quantum);
        if period == 0 {
            return Err(CompileError::Synchronization(format!(
                "{} is faster than the minimum instruction length of {} ns",
                signal, min_instruction_len
            )));
        }
        let offset = round_u64(signal.offset() as f64 / quantum);
        let high = match signal.authority() {
            Authority::DutyCycle => round_u64(period as f64 * signal.duty_cycle()),
            Authority::HighTime => round_u64(signal.high() as f64 / quantum),
        };

        instruction_cycles.push(period);
        instruction_cycles.push(high);
        if offset != 0 {
            instruction_cycles.push(offset);
        }
        pulses.push(Pulse {
            period,
            offset,
            high,
            channels: signal.channels().clone(),
            active_high: signal.active_high(),
        });
    }
    Ok((pulses, instruction_cycles))
}

/// Pulses in units of a (possibly coarsened) time quantum.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedPulses {
    pub pulses: Vec<Pulse>,
    pub masking_pulses: Vec<Pulse>,
    /// Length of one time step in ns.
    pub min_instruction_len: u64,
    /// Factor by which the original quantum was coarsened.
    pub gcd_cycles: u64,
}

/// Quantizes primary and masking signals and coarsens the quantum.
///
/// `nr_cycles` is the synchronized cycle count at the original quantum; it takes part in the
/// greatest common divisor so the repeating duration stays a whole number of coarsened steps.
///
/// ```
/// use pbcompiler_backend::quantize::quantize_and_coarsen;
/// use pbcompiler_backend::signal::SignalSpec;
///
/// let signal = SignalSpec::new(10., [0]).unwrap();
/// let quantized = quantize_and_coarsen(&[signal], &[], 20, 5_000_000).unwrap();
/// // 50 ms high, 50 ms low: one step of 50 ms is enough
/// assert_eq!(quantized.min_instruction_len, 50_000_000);
/// assert_eq!((quantized.pulses[0].period, quantized.pulses[0].high), (2, 1));
/// ```
pub fn quantize_and_coarsen(
    signals: &[SignalSpec],
    masking_signals: &[SignalSpec],
    min_instruction_len: u64,
    nr_cycles: u64,
) -> Result<QuantizedPulses> {
    let (mut pulses, mut instruction_cycles) = quantize_signals(signals, min_instruction_len)?;
    let (mut masking_pulses, masking_cycles) =
        quantize_signals(masking_signals, min_instruction_len)?;
    instruction_cycles.extend(masking_cycles);
    instruction_cycles.push(nr_cycles);

    let gcd_cycles = gcd_all(instruction_cycles).max(1);
    coarsen_pulses(gcd_cycles, &mut pulses, &mut masking_pulses);
    debug!(gcd_cycles, "quantum coarsened");

    Ok(QuantizedPulses {
        pulses,
        masking_pulses,
        min_instruction_len: min_instruction_len * gcd_cycles,
        gcd_cycles,
    })
}

/// Divides every pulse's period, offset and high count by `gcd_cycles`.
pub fn coarsen_pulses(gcd_cycles: u64, pulses: &mut [Pulse], masking_pulses: &mut [Pulse]) {
    if gcd_cycles == 1 {
        return;
    }
    pulses
        .iter_mut()
        .chain(masking_pulses.iter_mut())
        .for_each(|pulse| pulse.coarsen(gcd_cycles));
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;

    #[test]
    fn converts_to_instruction_lengths() {
        let signals = [
            SignalSpec::build(10., [0], 1000, 0.5, 0, true).unwrap(),
            SignalSpec::build(20., [1], 0, 0.5, 10_000_000, false).unwrap(),
        ];
        let (pulses, cycles) = quantize_signals(&signals, 20).unwrap();
        assert_eq!(
            pulses[0],
            Pulse {
                period: 5_000_000,
                offset: 50,
                high: 2_500_000,
                channels: btreeset! {0},
                active_high: true,
            }
        );
        assert_eq!((pulses[1].period, pulses[1].high), (2_500_000, 500_000));
        assert!(!pulses[1].active_high);
        // The zero offset of the second signal is left out
        assert_eq!(cycles, vec![5_000_000, 2_500_000, 50, 2_500_000, 500_000]);
    }

    #[test]
    fn coarsening_includes_masking_and_cycles() {
        let signals = [SignalSpec::new(10., [0]).unwrap()];
        let masking = [SignalSpec::new(20., [0]).unwrap()];
        let quantized = quantize_and_coarsen(&signals, &masking, 20, 5_000_000).unwrap();
        assert_eq!(quantized.gcd_cycles, 1_250_000);
        assert_eq!(quantized.min_instruction_len, 25_000_000);
        assert_eq!((quantized.pulses[0].period, quantized.pulses[0].high), (4, 2));
        let mask = &quantized.masking_pulses[0];
        assert_eq!((mask.period, mask.high), (2, 1));
    }

    #[test]
    fn coarsen_with_gcd_one_is_identity() {
        let mut pulses = vec![Pulse {
            period: 1000,
            offset: 0,
            high: 500,
            channels: btreeset! {0},
            active_high: true,
        }];
        let before = pulses.clone();
        coarsen_pulses(1, &mut pulses, &mut []);
        assert_eq!(pulses, before);
    }

    #[test]
    fn too_fast_signal_fails() {
        let signals = [SignalSpec::new(1e8, [0]).unwrap()];
        assert!(matches!(
            quantize_signals(&signals, 20),
            Err(CompileError::Synchronization(_))
        ));
    }
}
