//! Construction-time configuration for a [`crate::ConnectionManager`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::convert::CalibrationConstants;
use crate::errors::ConfigError;

/// Nominal acquisition rate of the instrument (Hz).
pub const DEFAULT_SAMPLING_RATE: u32 = 1000;

/// How long `start_calibration` waits for the instrument to answer.
pub const DEFAULT_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport read timeout; bounds how long the reader takes to notice a disconnect.
pub const DEFAULT_READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateConfig {
    pub calibration: CalibrationConstants,
    /// Reported on every sample; not derived from the data.
    pub sampling_rate: u32,
    pub calibration_timeout: Duration,
    pub read_poll_interval: Duration,
}

impl Default for PlateConfig {
    fn default() -> Self {
        Self {
            calibration: CalibrationConstants::default(),
            sampling_rate: DEFAULT_SAMPLING_RATE,
            calibration_timeout: DEFAULT_CALIBRATION_TIMEOUT,
            read_poll_interval: DEFAULT_READ_POLL_INTERVAL,
        }
    }
}

impl PlateConfig {
    pub fn with_calibration(mut self, max_raw_code: i32, max_physical_force: f64) -> Self {
        self.calibration = CalibrationConstants {
            max_raw_code,
            max_physical_force,
        };
        self
    }

    pub fn with_sampling_rate(mut self, hz: u32) -> Self {
        self.sampling_rate = hz;
        self
    }

    pub fn with_calibration_timeout(mut self, timeout: Duration) -> Self {
        self.calibration_timeout = timeout;
        self
    }

    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.calibration.max_raw_code <= 0 {
            return Err(ConfigError::Invalid(format!(
                "max_raw_code must be positive, got {}",
                self.calibration.max_raw_code
            )));
        }
        let force = self.calibration.max_physical_force;
        if !force.is_finite() || force <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "max_physical_force must be finite and positive, got {force}"
            )));
        }
        if self.sampling_rate == 0 {
            return Err(ConfigError::Invalid("sampling_rate must be non-zero".into()));
        }
        if self.calibration_timeout.is_zero() || self.read_poll_interval.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Largest acceptable spacing between consecutive device timestamps (ms).
    ///
    /// 1.5 nominal periods, rounded up, never below 2 ms.
    pub fn max_timestamp_step_ms(&self) -> u64 {
        1_500u64
            .div_ceil(self.sampling_rate.max(1) as u64)
            .max(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PlateConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.calibration.max_raw_code, 8_388_607);
        assert_eq!(cfg.sampling_rate, 1000);
    }

    #[test]
    fn rejects_bad_constants() {
        assert!(PlateConfig::default()
            .with_calibration(0, 500.0)
            .validate()
            .is_err());
        assert!(PlateConfig::default()
            .with_calibration(100, f64::NAN)
            .validate()
            .is_err());
        assert!(PlateConfig::default()
            .with_calibration(100, -1.0)
            .validate()
            .is_err());
        assert!(PlateConfig::default()
            .with_sampling_rate(0)
            .validate()
            .is_err());
        assert!(PlateConfig::default()
            .with_calibration_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn timestamp_step_tracks_rate() {
        assert_eq!(PlateConfig::default().max_timestamp_step_ms(), 2);
        assert_eq!(
            PlateConfig::default()
                .with_sampling_rate(100)
                .max_timestamp_step_ms(),
            15
        );
        assert_eq!(
            PlateConfig::default()
                .with_sampling_rate(1)
                .max_timestamp_step_ms(),
            1500
        );
    }
}
