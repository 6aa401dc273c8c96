//! Raw ADC code to physical force conversion.

use serde::{Deserialize, Serialize};

/// Full-scale magnitude of a signed 24-bit ADC.
pub const DEFAULT_MAX_RAW_CODE: i32 = 8_388_607;

/// Rated full-scale force of the load cells (N).
pub const DEFAULT_MAX_PHYSICAL_FORCE: f64 = 500.0;

/// Calibration constants shared by all eight load cells.
///
/// Immutable for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConstants {
    /// Signed full-scale code of the ADC.
    pub max_raw_code: i32,
    /// Force corresponding to `max_raw_code`.
    pub max_physical_force: f64,
}

impl Default for CalibrationConstants {
    fn default() -> Self {
        Self {
            max_raw_code: DEFAULT_MAX_RAW_CODE,
            max_physical_force: DEFAULT_MAX_PHYSICAL_FORCE,
        }
    }
}

/// Linear raw-code to force mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    constants: CalibrationConstants,
}

impl UnitConverter {
    pub fn new(constants: CalibrationConstants) -> Self {
        Self { constants }
    }

    pub fn constants(&self) -> CalibrationConstants {
        self.constants
    }

    /// `raw / max_raw_code * max_physical_force`.
    ///
    /// Codes beyond full scale are not clamped, so saturation shows up
    /// downstream as an out-of-range force.
    #[inline]
    pub fn raw_to_force(&self, raw: i32) -> f64 {
        raw as f64 / self.constants.max_raw_code as f64 * self.constants.max_physical_force
    }

    #[inline]
    pub fn convert_all(&self, raw: [i32; 4]) -> [f64; 4] {
        raw.map(|r| self.raw_to_force(r))
    }
}

impl Default for UnitConverter {
    fn default() -> Self {
        Self::new(CalibrationConstants::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_mapping() {
        let conv = UnitConverter::default();
        for raw in [0, 1, 100, -100, 4_194_303, -8_000_000] {
            let expected = raw as f64 / 8_388_607.0 * 500.0;
            assert_relative_eq!(conv.raw_to_force(raw), expected, max_relative = 1e-12);
        }
    }

    #[test]
    fn full_scale_maps_to_rated_force() {
        let conv = UnitConverter::default();
        assert_relative_eq!(conv.raw_to_force(DEFAULT_MAX_RAW_CODE), 500.0);
        assert_relative_eq!(conv.raw_to_force(-DEFAULT_MAX_RAW_CODE), -500.0);
    }

    #[test]
    fn out_of_range_codes_are_not_clamped() {
        let conv = UnitConverter::new(CalibrationConstants {
            max_raw_code: 1000,
            max_physical_force: 10.0,
        });
        assert_relative_eq!(conv.raw_to_force(2000), 20.0);
        assert_relative_eq!(conv.raw_to_force(i32::MIN), i32::MIN as f64 / 100.0);
    }

    #[test]
    fn converts_a_platform() {
        let conv = UnitConverter::new(CalibrationConstants {
            max_raw_code: 100,
            max_physical_force: 1.0,
        });
        assert_eq!(conv.convert_all([0, 50, -50, 100]), [0.0, 0.5, -0.5, 1.0]);
    }
}
