//! Python bindings, built with the `python` feature.
//!
//! Exposes `Signal`, `InstructionSequence`, `generate_repeating_pulses` and `code_to_instructions`.
//! Timelines are returned as numpy arrays and every [`CompileError`] surfaces as `ValueError`.
//!
//! # Example (python)
//! ```python
//! from pbcompiler_backend import Signal, generate_repeating_pulses
//!
//! seq = generate_repeating_pulses([Signal(10.0, [0]), Signal(20.0, [1], active_high=False)])
//! print(seq.durations(), seq.flags().shape, seq.branch_index())
//! ```

use numpy::{PyArray1, PyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::assembler;
use crate::compiler;
use crate::config::{AssemblerConfig, CompilerConfig};
use crate::error::CompileError;
use crate::instruction::InstructionSequence;
use crate::signal::SignalSpec;

impl From<CompileError> for PyErr {
    fn from(err: CompileError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

fn non_negative(name: &str, value: i64) -> PyResult<u64> {
    u64::try_from(value).map_err(|_| {
        PyValueError::new_err(format!("{} must be non-negative, got {}", name, value))
    })
}

#[pyclass(name = "Signal")]
#[derive(Clone)]
pub struct PySignal {
    inner: SignalSpec,
}

#[pymethods]
impl PySignal {
    #[new]
    #[pyo3(signature = (frequency, channels, offset=0, duty_cycle=0.5, high=0, active_high=true))]
    fn new(
        frequency: f64,
        channels: Vec<i64>,
        offset: i64,
        duty_cycle: f64,
        high: i64,
        active_high: bool,
    ) -> PyResult<Self> {
        let channels = channels
            .into_iter()
            .map(|chan| {
                usize::try_from(chan).map_err(|_| {
                    PyValueError::new_err(format!("Channels must be non-negative, got {}", chan))
                })
            })
            .collect::<PyResult<Vec<usize>>>()?;
        let inner = SignalSpec::build(
            frequency,
            channels,
            non_negative("Offset", offset)?,
            duty_cycle,
            non_negative("High time", high)?,
            active_high,
        )?;
        Ok(PySignal { inner })
    }

    #[getter]
    fn frequency(&self) -> f64 {
        self.inner.frequency()
    }
    #[getter]
    fn channels(&self) -> Vec<usize> {
        self.inner.channels().iter().copied().collect()
    }
    #[getter]
    fn offset(&self) -> u64 {
        self.inner.offset()
    }
    #[getter]
    fn duty_cycle(&self) -> f64 {
        self.inner.duty_cycle()
    }
    #[getter]
    fn high(&self) -> u64 {
        self.inner.high()
    }
    #[getter]
    fn active_high(&self) -> bool {
        self.inner.active_high()
    }

    fn __repr__(&self) -> String {
        self.inner.to_string()
    }
}

#[pyclass(name = "InstructionSequence")]
pub struct PyInstructionSequence {
    inner: InstructionSequence,
}

#[pymethods]
impl PyInstructionSequence {
    fn durations<'py>(&self, py: Python<'py>) -> &'py PyArray1<u64> {
        PyArray1::from_slice(py, self.inner.durations())
    }

    /// Flags of every unrolled step, shape `(steps, nr_channels)`.
    fn flags<'py>(&self, py: Python<'py>) -> &'py PyArray2<u8> {
        PyArray2::from_array(py, self.inner.flags())
    }

    fn branch_index(&self) -> Option<usize> {
        self.inner.branch_index()
    }

    fn cumulative_times<'py>(&self, py: Python<'py>) -> &'py PyArray1<u64> {
        PyArray1::from_vec(py, self.inner.cumulative_times())
    }

    #[pyo3(signature = (exclude_channels=Vec::new()))]
    fn active_channels(&self, exclude_channels: Vec<usize>) -> PyResult<Vec<usize>> {
        Ok(self.inner.active_channels(&exclude_channels)?)
    }

    fn total_duration(&self) -> u64 {
        self.inner.total_duration()
    }

    /// Program rows as `(label, flag bits, duration, opcode, inst_data)`, channel 0 first.
    fn instructions(&self) -> Vec<(Option<String>, Vec<u8>, u64, &'static str, i64)> {
        let nr_channels = self.inner.nr_channels();
        self.inner
            .instructions()
            .iter()
            .map(|instr| {
                (
                    instr.label.clone(),
                    instr.flag_bits(nr_channels),
                    instr.duration,
                    instr.opcode.name(),
                    instr.inst_data,
                )
            })
            .collect()
    }

    fn __len__(&self) -> usize {
        self.inner.instructions().len()
    }

    fn __repr__(&self) -> String {
        self.inner.to_string()
    }
}

#[pyfunction]
#[pyo3(signature = (signals, masking_signals=None, min_instruction_len=20, nr_channels=24, reserved_channels=3))]
fn generate_repeating_pulses(
    signals: Vec<PySignal>,
    masking_signals: Option<Vec<PySignal>>,
    min_instruction_len: u64,
    nr_channels: usize,
    reserved_channels: usize,
) -> PyResult<PyInstructionSequence> {
    let signals: Vec<SignalSpec> = signals.into_iter().map(|s| s.inner).collect();
    let masking_signals: Vec<SignalSpec> = masking_signals
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.inner)
        .collect();
    let config = CompilerConfig::default()
        .with_min_instruction_len(min_instruction_len)
        .with_channels(nr_channels, reserved_channels);
    let inner = compiler::generate_repeating_pulses(&signals, &masking_signals, &config)?;
    Ok(PyInstructionSequence { inner })
}

#[pyfunction]
#[pyo3(signature = (code, nr_flags=24))]
fn code_to_instructions(code: &str, nr_flags: usize) -> PyResult<PyInstructionSequence> {
    let config = AssemblerConfig::default().with_nr_flags(nr_flags);
    let inner = assembler::code_to_instructions(code, &config)?;
    Ok(PyInstructionSequence { inner })
}

#[pymodule]
fn pbcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PySignal>()?;
    m.add_class::<PyInstructionSequence>()?;
    m.add_function(wrap_pyfunction!(generate_repeating_pulses, m)?)?;
    m.add_function(wrap_pyfunction!(code_to_instructions, m)?)?;
    Ok(())
}
