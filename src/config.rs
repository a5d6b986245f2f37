//! Runtime configuration.
//!
//! Every field has a default matching the strap's behaviour, so a config file
//! only needs to name what it changes:
//!
//! ```toml
//! [sensor]
//! stale_after_ms = 4000
//!
//! [supervisor]
//! max_attempts = 5
//!
//! [serial]
//! path = "/dev/ttyUSB0"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{DriverError, Result};

const DEFAULT_STALE_AFTER_MS: u64 = 4_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_RESET_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_RECONNECT_COOLDOWN_MS: u64 = 5_000;
const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1_000;
const DEFAULT_BAUD_RATE: u32 = 57_600;
const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Page silence after which an active sensor reports signal lost.
    pub stale_after_ms: u64,
    /// Upper bound on how long `stop()` waits for the worker.
    pub stop_timeout_ms: u64,
    /// Upper bound on how long `start()` waits for the channel to open.
    pub open_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
        }
    }
}

impl SensorConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Reconnect supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay between attempts while the device reports busy.
    pub retry_delay_ms: u64,
    /// Attempts (including the first) before a busy device becomes an error.
    pub max_attempts: u32,
    /// Wait after a manual reset so the OS can release the interface.
    pub reset_debounce_ms: u64,
    /// Restart the sensor when its worker dies while the link is active.
    pub auto_reconnect: bool,
    /// Minimum spacing between automatic reconnects.
    pub reconnect_cooldown_ms: u64,
    pub watchdog_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reset_debounce_ms: DEFAULT_RESET_DEBOUNCE_MS,
            auto_reconnect: true,
            reconnect_cooldown_ms: DEFAULT_RECONNECT_COOLDOWN_MS,
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
        }
    }
}

impl SupervisorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reset_debounce(&self) -> Duration {
        Duration::from_millis(self.reset_debounce_ms)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// ANT USB stick on a serial port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: Option<String>,
    pub baud_rate: u32,
    /// Read timeout; also bounds how quickly the receive loop sees a stop.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sensor: SensorConfig,
    pub supervisor: SupervisorConfig,
    pub serial: SerialConfig,
}

impl MonitorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MonitorConfig =
            toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sensor.stale_after_ms == 0 {
            return Err(DriverError::Config("sensor.stale_after_ms must be > 0".into()));
        }
        if self.sensor.open_timeout_ms == 0 {
            return Err(DriverError::Config("sensor.open_timeout_ms must be > 0".into()));
        }
        if self.supervisor.max_attempts == 0 {
            return Err(DriverError::Config("supervisor.max_attempts must be >= 1".into()));
        }
        if self.supervisor.watchdog_interval_ms == 0 {
            return Err(DriverError::Config(
                "supervisor.watchdog_interval_ms must be > 0".into(),
            ));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(DriverError::Config("serial.read_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = MonitorConfig::from_toml_str("").unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.sensor.stale_after(), Duration::from_secs(4));
        assert_eq!(config.sensor.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.supervisor.max_attempts, 10);
        assert_eq!(config.supervisor.retry_delay(), Duration::from_millis(500));
        assert_eq!(config.supervisor.reset_debounce(), Duration::from_secs(2));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = MonitorConfig::from_toml_str(
            r#"
            [supervisor]
            max_attempts = 3

            [serial]
            path = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert_eq!(config.supervisor.max_attempts, 3);
        assert_eq!(config.supervisor.retry_delay_ms, 500);
        assert_eq!(config.serial.path.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial.baud_rate, 57_600);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = MonitorConfig::from_toml_str("[supervisor]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
        assert!(MonitorConfig::from_toml_str("[sensor]\nstale_after_ms = \"soon\"\n").is_err());
    }
}
