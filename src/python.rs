//! Python bindings (feature `python`).
//!
//! ```python
//! import ant_hrm
//! ant_hrm.init_logging()
//! sensor = ant_hrm.HrvSensor(port="/dev/ttyUSB0")
//! sensor.start()
//! data = sensor.get_data()
//! print(data["bpm"], data["rmssd_ms"], data["status"])
//! sensor.stop()
//! ```

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::MonitorConfig;
use crate::errors::DriverError;
use crate::logging;
use crate::replay::{self, ReplayConnector};
use crate::sensor::HrvSensor;
use crate::serial::SerialConnector;
use crate::snapshot::DataSnapshot;
use crate::supervisor::{LinkState, Supervisor};

impl From<DriverError> for PyErr {
    fn from(e: DriverError) -> Self {
        let msg = e.to_string();
        match e {
            DriverError::Config(_) => PyValueError::new_err(msg),
            DriverError::Busy(_) => PyConnectionError::new_err(msg),
            DriverError::Timeout(_) => PyTimeoutError::new_err(msg),
            DriverError::Io(_) | DriverError::Serial(_) => PyIOError::new_err(msg),
            _ => PyRuntimeError::new_err(msg),
        }
    }
}

fn snapshot_to_dict<'py>(py: Python<'py>, data: &DataSnapshot) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("bpm", data.bpm)?;
    dict.set_item("rmssd_ms", data.rmssd_ms)?;
    dict.set_item("rr_ms", data.rr_ms)?;
    dict.set_item("raw_rr_ms", data.raw_rr_ms)?;
    dict.set_item("status", data.status.to_string())?;
    dict.set_item("manufacturer", &data.manufacturer)?;
    dict.set_item("manufacturer_id", data.manufacturer_id)?;
    dict.set_item("serial", data.serial)?;
    dict.set_item("hw_version", data.hw_version)?;
    dict.set_item("sw_version", data.sw_version)?;
    dict.set_item("model_number", data.model_number)?;
    dict.set_item("battery_volts", data.battery_volts)?;
    dict.set_item("battery_state", &data.battery_state)?;
    dict.set_item("uptime_hours", data.uptime_hours)?;
    dict.set_item("raw_packet_hex", &data.raw_packet_hex)?;
    dict.set_item("rr_count", data.rr_count)?;
    dict.set_item("consecutive_rejections", data.consecutive_rejections)?;
    dict.set_item("malformed_packets", data.malformed_packets)?;
    Ok(dict)
}

/// ANT+ heart-rate strap with automatic reconnects.
///
/// Args:
///     port: Serial device of the ANT USB stick (e.g. "/dev/ttyUSB0").
///     replay: Recording to play instead of real hardware.
///     config: Optional TOML config file.
///     loop_replay: Restart the recording when it ends. Default: True.
///
/// Raises:
///     ValueError: If neither a port nor a recording is given.
#[pyclass(name = "HrvSensor")]
struct PyHrvSensor {
    supervisor: Supervisor,
}

#[pymethods]
impl PyHrvSensor {
    #[new]
    #[pyo3(signature = (port=None, replay=None, config=None, loop_replay=true))]
    fn new(
        port: Option<String>,
        replay: Option<String>,
        config: Option<String>,
        loop_replay: bool,
    ) -> PyResult<Self> {
        let mut config = match config {
            Some(path) => MonitorConfig::load(path)?,
            None => MonitorConfig::default(),
        };

        let sensor = match (port, replay) {
            (_, Some(recording)) => {
                let connector =
                    ReplayConnector::load(recording, replay::DEFAULT_INTERVAL, loop_replay)?;
                HrvSensor::new(config.sensor.clone(), connector)
            }
            (port, None) => {
                if port.is_some() {
                    config.serial.path = port;
                }
                if config.serial.path.is_none() {
                    return Err(PyValueError::new_err("either port or replay is required"));
                }
                HrvSensor::new(config.sensor.clone(), SerialConnector::new(config.serial.clone()))
            }
        };

        Ok(Self {
            supervisor: Supervisor::new(config.supervisor.clone(), sensor)?,
        })
    }

    /// Begin connecting in the background.
    ///
    /// Returns:
    ///     False if already connected or a connect sequence is in progress.
    fn start(&self) -> bool {
        self.supervisor.connect()
    }

    /// Release the device. Safe to call more than once.
    fn stop(&self, py: Python<'_>) {
        py.detach(|| self.supervisor.shutdown());
    }

    /// Close the device and reconnect after a short debounce.
    fn reset(&self) {
        self.supervisor.reset();
    }

    /// Current heart rate, HRV and device information as a dict.
    fn get_data<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        snapshot_to_dict(py, &self.supervisor.snapshot())
    }

    #[getter]
    fn running(&self) -> bool {
        self.supervisor.sensor().is_running()
    }

    #[getter]
    fn status(&self) -> String {
        self.supervisor.snapshot().status.to_string()
    }

    fn __repr__(&self) -> String {
        let link = match self.supervisor.state() {
            LinkState::Error(_) => "error",
            LinkState::Active => "active",
            LinkState::Stopped => "stopped",
            LinkState::Idle => "idle",
            LinkState::Connecting { .. } | LinkState::Backoff { .. } => "connecting",
        };
        format!("HrvSensor(link={link})")
    }
}

/// Route Rust log records into Python's `logging` module.
#[pyfunction]
fn init_logging(py: Python<'_>) -> PyResult<()> {
    logging::init_python_logging(py)
}

/// Set the minimum forwarded level ("error" .. "trace"); None uses ANT_HRM_LOG.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    let level = logging::parse_level(level).unwrap_or_else(logging::env_level);
    logging::set_python_log_level(py, level)
}

/// Call after reconfiguring Python logging.
#[pyfunction]
fn reset_log_cache() {
    logging::reset_python_logging_cache();
}

#[pymodule]
#[pyo3(name = "ant_hrm")]
fn python_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyHrvSensor>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(reset_log_cache, m)?)?;
    m.add("STALE_AFTER_MS", crate::config::SensorConfig::default().stale_after_ms)?;
    Ok(())
}
