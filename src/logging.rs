//! Log setup for binaries and the Python bridge.
//!
//! The level comes from `FORCEPLATE_LOG`, then `RUST_LOG`, defaulting to `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

#[cfg(feature = "python")]
pub use self::python_bridge::*;

static RUST_LOG_ONCE: Once = Once::new();

pub fn env_level() -> LevelFilter {
    std::env::var("FORCEPLATE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize logging for Rust binaries (stderr formatter). Later calls are no-ops.
pub fn init_rust_logging() {
    init_rust_logging_with(env_level());
}

/// Like [`init_rust_logging`] with an explicit default level; `FORCEPLATE_LOG` still wins.
pub fn init_rust_logging_with(default: LevelFilter) {
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default()
            .filter_or("FORCEPLATE_LOG", level_to_str(default))
            .write_style("FORCEPLATE_LOG_STYLE");
        // A logger installed elsewhere (e.g. the Python bridge) takes precedence.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyAny;

    use super::{env_level, parse_level};
    use crate::lock;

    static BRIDGE: OnceCell<&'static PyBridge> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target>)`, with `::` mapped to `.`.
    struct PyBridge {
        max_level: Mutex<LevelFilter>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn py_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyBridge {
        fn logger(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = lock(&self.loggers);
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = py
                .import("logging")?
                .call_method1("getLogger", (target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }
    }

    impl Log for PyBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *lock(&self.max_level)
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let target = record.target().replace("::", ".");
            let message = record.args().to_string();
            Python::attach(|py| {
                let result = self.logger(py, &target).and_then(|logger| {
                    logger
                        .bind(py)
                        .call_method1("log", (py_level(record.level()), message))
                        .map(|_| ())
                });
                if let Err(e) = result {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Only the first call installs the bridge.
    pub fn init_python_logging() {
        let level = env_level();
        let bridge = BRIDGE.get_or_init(|| {
            Box::leak(Box::new(PyBridge {
                max_level: Mutex::new(level),
                loggers: Mutex::new(HashMap::new()),
            }))
        });
        if log::set_logger(*bridge).is_ok() {
            log::set_max_level(level);
        }
    }

    /// Forget cached Python loggers (after reconfiguring Python logging).
    pub fn reset_python_logging_cache() {
        if let Some(bridge) = BRIDGE.get() {
            lock(&bridge.loggers).clear();
        }
    }

    /// Set the minimum forwarded level; `None` falls back to the environment.
    pub fn set_python_log_level(level: Option<&str>) {
        init_python_logging();
        let level = level.and_then(parse_level).unwrap_or_else(env_level);
        if let Some(bridge) = BRIDGE.get() {
            *lock(&bridge.max_level) = level;
        }
        log::set_max_level(level);
    }
}
