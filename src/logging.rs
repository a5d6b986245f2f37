//! Logging setup.
//!
//! The library only emits through the `log` facade. Binaries call
//! [`init_rust_logging`]; the Python extension routes records into Python's
//! `logging` module instead (feature `python`).

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `ANT_HRM_LOG`, then `RUST_LOG`, default info.
pub fn env_level() -> LevelFilter {
    std::env::var("ANT_HRM_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Install an stderr logger with millisecond timestamps. Later calls do nothing.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, reset_python_logging_cache, set_python_log_level};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::env_level;
    use crate::sensor::lock;

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    struct TargetLogger {
        max_level: LevelFilter,
        logger: Py<PyAny>,
    }

    /// Forwards `log` records to `logging.getLogger(<target>)`.
    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        targets: Mutex<HashMap<String, TargetLogger>>,
    }

    fn python_level(level: Level) -> usize {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: py.import("logging")?.into(),
                targets: Mutex::new(HashMap::new()),
            })
        }

        /// Most verbose level the Python logger would accept.
        fn max_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (python_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn lookup(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut targets = lock(&self.targets);
            if let Some(entry) = targets.get(target) {
                return Ok((entry.max_level, entry.logger.clone_ref(py)));
            }

            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let max_level = Self::max_level(&logger).unwrap_or(LevelFilter::Off);
            let logger = logger.unbind();
            targets.insert(
                target.to_string(),
                TargetLogger {
                    max_level,
                    logger: logger.clone_ref(py),
                },
            );
            Ok((max_level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (max_level, logger) = self.lookup(py, &target)?;

            let level = record.level().to_level_filter();
            if level > max_level || level > *lock(&self.top_filter) {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    python_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *lock(&self.top_filter)
        }

        fn log(&self, record: &Record) {
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn install(py: Python<'_>, level: LevelFilter) {
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => e.restore(py),
        });
    }

    /// Route this crate's log records into Python's `logging`. Idempotent.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        install(py, env_level());
        Ok(())
    }

    /// Forget cached per-target loggers after Python logging was reconfigured.
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            lock(&logger.targets).clear();
        }
    }

    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        install(py, level);
        if let Some(logger) = PY_LOGGER.get() {
            *lock(&logger.top_filter) = level;
            reset_python_logging_cache();
        }
        log::set_max_level(level);
        Ok(())
    }
}
