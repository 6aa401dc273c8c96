//! Python bindings (`_core` extension module).

use std::time::Duration;

use pyo3::exceptions::{
    PyConnectionError, PyIOError, PyPermissionError, PyRuntimeError, PyTimeoutError,
    PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tokio::runtime::Runtime;

use crate::config::PlateConfig;
use crate::connection::ConnectionManager;
use crate::errors::{CalibrationError, ConnectError};
use crate::frame::SampleRecord;
use crate::ingest::IngestStats;
use crate::logging;
use crate::stream::{StreamEnd, Subscription};
use crate::transport::{DeviceHandle, SerialDriver, TransportDriver};

/// One decoded sample (dataclass-like).
///
/// Attributes:
///     timestamp_ms: Device capture time, ms since the Unix epoch.
///     left: Forces of the four left load cells.
///     right: Forces of the four right load cells.
///     sampling_rate: Nominal acquisition rate (Hz).
///     sample_index: Host sequence number, 0 for the first sample of a connection.
#[pyclass(name = "Sample", frozen)]
#[derive(Clone)]
struct PySample {
    #[pyo3(get)]
    timestamp_ms: u64,
    #[pyo3(get)]
    left: Vec<f64>,
    #[pyo3(get)]
    right: Vec<f64>,
    #[pyo3(get)]
    sampling_rate: u32,
    #[pyo3(get)]
    sample_index: u64,
}

#[pymethods]
impl PySample {
    fn __repr__(&self) -> String {
        format!(
            "Sample(index={}, timestamp_ms={}, left={:?}, right={:?})",
            self.sample_index, self.timestamp_ms, self.left, self.right
        )
    }

    /// Summed force over both platforms.
    #[getter]
    fn total(&self) -> f64 {
        self.left.iter().chain(self.right.iter()).sum()
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("timestamp_ms", self.timestamp_ms)?;
        dict.set_item("left", self.left.clone())?;
        dict.set_item("right", self.right.clone())?;
        dict.set_item("sampling_rate", self.sampling_rate)?;
        dict.set_item("sample_index", self.sample_index)?;
        Ok(dict)
    }
}

impl From<SampleRecord> for PySample {
    fn from(r: SampleRecord) -> Self {
        PySample {
            timestamp_ms: r.timestamp_ms(),
            left: r.left_channels.to_vec(),
            right: r.right_channels.to_vec(),
            sampling_rate: r.sampling_rate,
            sample_index: r.sample_index,
        }
    }
}

/// Ingest counters of the current connection.
#[pyclass(name = "Stats", frozen)]
#[derive(Clone)]
struct PyStats {
    #[pyo3(get)]
    samples_decoded: u64,
    #[pyo3(get)]
    corrupted_frames: u64,
    #[pyo3(get)]
    bytes_received: u64,
    #[pyo3(get)]
    timestamp_gaps: u64,
    #[pyo3(get)]
    pending_bytes: u64,
}

#[pymethods]
impl PyStats {
    fn __repr__(&self) -> String {
        format!(
            "Stats(samples={}, corrupted={}, bytes={}, gaps={})",
            self.samples_decoded, self.corrupted_frames, self.bytes_received, self.timestamp_gaps
        )
    }

    #[getter]
    fn has_errors(&self) -> bool {
        self.corrupted_frames > 0 || self.timestamp_gaps > 0
    }
}

impl From<IngestStats> for PyStats {
    fn from(s: IngestStats) -> Self {
        PyStats {
            samples_decoded: s.samples_decoded,
            corrupted_frames: s.corrupted_frames,
            bytes_received: s.bytes_received,
            timestamp_gaps: s.timestamp_gaps,
            pending_bytes: s.pending_bytes,
        }
    }
}

fn connect_err(e: ConnectError) -> PyErr {
    match e {
        ConnectError::PermissionDenied { .. } => PyErr::new::<PyPermissionError, _>(e.to_string()),
        _ => PyErr::new::<PyConnectionError, _>(e.to_string()),
    }
}

fn calibration_err(e: CalibrationError) -> PyErr {
    match e {
        CalibrationError::NotConnected => PyErr::new::<PyRuntimeError, _>(e.to_string()),
        CalibrationError::Timeout(_) => PyErr::new::<PyTimeoutError, _>(e.to_string()),
        CalibrationError::TransportFailure(_) => PyErr::new::<PyIOError, _>(e.to_string()),
    }
}

/// Dual force-plate driver.
///
/// Example:
///     >>> plate = ForcePlate(max_raw_code=8388607, max_force=500.0)
///     >>> plate.connect("/dev/ttyUSB0")
///     >>> samples = plate.read(1000)
///     >>> plate.calibrate()
///     >>> plate.disconnect()
#[pyclass(name = "ForcePlate", unsendable)]
struct PyForcePlate {
    runtime: Runtime,
    manager: ConnectionManager,
    samples: Option<Subscription>,
}

#[pymethods]
impl PyForcePlate {
    #[new]
    #[pyo3(signature = (max_raw_code=8_388_607, max_force=500.0, sampling_rate=1000, calibration_timeout_ms=5000))]
    fn new(
        max_raw_code: i32,
        max_force: f64,
        sampling_rate: u32,
        calibration_timeout_ms: u64,
    ) -> PyResult<Self> {
        let config = PlateConfig::default()
            .with_calibration(max_raw_code, max_force)
            .with_sampling_rate(sampling_rate)
            .with_calibration_timeout(Duration::from_millis(calibration_timeout_ms));
        let manager = ConnectionManager::serial(config)
            .map_err(|e| PyErr::new::<PyValueError, _>(e.to_string()))?;
        let runtime = Runtime::new()
            .map_err(|e| PyErr::new::<PyRuntimeError, _>(format!("tokio runtime init failed: {e}")))?;
        Ok(PyForcePlate {
            runtime,
            manager,
            samples: None,
        })
    }

    /// List serial ports that could host the instrument.
    #[staticmethod]
    fn list_devices() -> PyResult<Vec<String>> {
        SerialDriver
            .list_devices()
            .map(|devices| devices.into_iter().map(|d| d.path).collect())
            .map_err(|e| PyErr::new::<PyIOError, _>(e.to_string()))
    }

    /// Open the port and start streaming. Samples are buffered from this point on.
    fn connect(&mut self, port: &str) -> PyResult<()> {
        let device = DeviceHandle::new(port);
        let samples = self
            .runtime
            .block_on(self.manager.connect_subscribed(&device))
            .map_err(connect_err)?;
        self.samples = Some(samples);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.manager.disconnect();
        self.samples = None;
    }

    /// Read up to `n_samples`, waiting at most `timeout_ms` for them.
    ///
    /// Raises:
    ///     IOError: If the connection faulted.
    ///     RuntimeError: If not connected.
    #[pyo3(signature = (n_samples=100, timeout_ms=1000))]
    fn read(&mut self, n_samples: usize, timeout_ms: u64) -> PyResult<Vec<PySample>> {
        let Some(sub) = self.samples.as_mut() else {
            return Err(PyErr::new::<PyRuntimeError, _>("not connected"));
        };
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut out = Vec::with_capacity(n_samples);
        let end = self.runtime.block_on(async {
            while out.len() < n_samples {
                match tokio::time::timeout_at(deadline, sub.recv()).await {
                    Ok(Ok(sample)) => out.push(PySample::from(sample)),
                    Ok(Err(end)) => return Some(end),
                    Err(_) => break,
                }
            }
            None
        });
        match end {
            Some(StreamEnd::Faulted(e)) if out.is_empty() => {
                Err(PyErr::new::<PyIOError, _>(e.to_string()))
            }
            _ => Ok(out),
        }
    }

    /// Run the calibration handshake.
    ///
    /// Raises:
    ///     TimeoutError: If the instrument did not answer in time.
    fn calibrate(&mut self) -> PyResult<()> {
        self.runtime
            .block_on(self.manager.start_calibration())
            .map_err(calibration_err)
    }

    fn stats(&self) -> PyStats {
        self.manager.stats().into()
    }

    #[getter]
    fn state(&self) -> String {
        self.manager.state().to_string()
    }

    #[getter]
    fn sampling_rate(&self) -> u32 {
        self.manager.config().sampling_rate
    }

    fn __repr__(&self) -> String {
        format!(
            "ForcePlate(state={}, rate={}Hz)",
            self.manager.state(),
            self.manager.config().sampling_rate
        )
    }
}

/// Set the level of Rust logs forwarded to Python's `logging` (None = from environment).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(level: Option<&str>) {
    logging::set_python_log_level(level);
}

#[pymodule]
#[pyo3(name = "_core")]
fn forceplate_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging();

    m.add_class::<PyForcePlate>()?;
    m.add_class::<PySample>()?;
    m.add_class::<PyStats>()?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("FRAME_SIZE", crate::frame::FRAME_SIZE)?;
    m.add("BAUD_RATE", crate::transport::BAUD_RATE)?;
    m.add("DEFAULT_SAMPLING_RATE", crate::config::DEFAULT_SAMPLING_RATE)?;

    Ok(())
}
