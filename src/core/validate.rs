//! Plausibility checks for decoded samples.
//!
//! Each rule only applies when the field is present; a missing value is
//! always valid. Rules compare the reading as received, before any rounding
//! to the stored integer form, so 250.4 bpm is rejected rather than stored
//! as 250.

use crate::core::sample::Sample;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Accepted heart rate range (bpm, inclusive).
pub const HEART_RATE_RANGE: RangeInclusive<f64> = 30.0..=250.0;

/// Accepted battery range (percent, inclusive).
pub const BATTERY_RANGE: RangeInclusive<f64> = 0.0..=100.0;

/// Accepted speed range (m/s, inclusive).
pub const SPEED_RANGE: RangeInclusive<f64> = 0.0..=20.0;

/// Accepted cadence range (steps/min, inclusive).
pub const CADENCE_RANGE: RangeInclusive<f64> = 0.0..=300.0;

/// Reason a sample was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid heart rate: {0}")]
    HeartRate(f64),
    #[error("Invalid battery percentage: {0}")]
    Battery(f64),
    #[error("Invalid speed: {0} m/s")]
    Speed(f64),
    #[error("Invalid cadence: {0}")]
    Cadence(f64),
}

/// The validated fields of a sample at full precision.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    pub heart_rate_bpm: Option<f64>,
    pub battery_pct: Option<f64>,
    pub speed_mps: Option<f64>,
    pub cadence_spm: Option<f64>,
}

impl Readings {
    /// Readings of an already normalized sample.
    pub fn of(sample: &Sample) -> Self {
        Self {
            heart_rate_bpm: sample.heart_rate_bpm.map(f64::from),
            battery_pct: sample.battery_pct.map(f64::from),
            speed_mps: sample.speed_mps,
            cadence_spm: sample.cadence_spm.map(f64::from),
        }
    }
}

/// Check a sample against the physiological plausibility rules.
pub fn validate(sample: &Sample) -> Result<(), ValidationError> {
    validate_readings(&Readings::of(sample))
}

/// Check raw readings. NaN fails every range.
pub fn validate_readings(readings: &Readings) -> Result<(), ValidationError> {
    check(readings.heart_rate_bpm, &HEART_RATE_RANGE, ValidationError::HeartRate)?;
    check(readings.battery_pct, &BATTERY_RANGE, ValidationError::Battery)?;
    check(readings.speed_mps, &SPEED_RANGE, ValidationError::Speed)?;
    check(readings.cadence_spm, &CADENCE_RANGE, ValidationError::Cadence)
}

fn check(
    value: Option<f64>,
    range: &RangeInclusive<f64>,
    reject: fn(f64) -> ValidationError,
) -> Result<(), ValidationError> {
    match value {
        Some(value) if !range.contains(&value) => Err(reject(value)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heart_rate_boundaries() {
        assert_eq!(
            validate(&Sample::at(0.0).with_heart_rate(29)),
            Err(ValidationError::HeartRate(29.0))
        );
        assert!(validate(&Sample::at(0.0).with_heart_rate(30)).is_ok());
        assert!(validate(&Sample::at(0.0).with_heart_rate(250)).is_ok());
        assert_eq!(
            validate(&Sample::at(0.0).with_heart_rate(251)),
            Err(ValidationError::HeartRate(251.0))
        );
    }

    #[test]
    fn test_absent_fields_are_valid() {
        assert!(validate(&Sample::at(0.0)).is_ok());
    }

    #[test]
    fn test_other_ranges() {
        let mut sample = Sample::at(0.0);
        sample.battery_pct = Some(101);
        assert_eq!(validate(&sample), Err(ValidationError::Battery(101.0)));

        let sample = Sample::at(0.0).with_speed(20.5);
        assert!(matches!(validate(&sample), Err(ValidationError::Speed(_))));

        let sample = Sample::at(0.0).with_speed(-0.1);
        assert!(matches!(validate(&sample), Err(ValidationError::Speed(_))));

        let sample = Sample::at(0.0).with_cadence(301);
        assert_eq!(validate(&sample), Err(ValidationError::Cadence(301.0)));

        let sample = Sample::at(0.0).with_speed(20.0).with_cadence(300);
        assert!(validate(&sample).is_ok());
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(
            ValidationError::HeartRate(251.0).to_string(),
            "Invalid heart rate: 251"
        );
        assert_eq!(
            ValidationError::Speed(25.0).to_string(),
            "Invalid speed: 25 m/s"
        );
    }

    #[test]
    fn test_fractional_readings_checked_before_rounding() {
        let hr = |bpm: f64| Readings {
            heart_rate_bpm: Some(bpm),
            ..Readings::default()
        };
        assert_eq!(
            validate_readings(&hr(29.6)),
            Err(ValidationError::HeartRate(29.6))
        );
        assert!(validate_readings(&hr(29.5)).is_err());
        assert!(validate_readings(&hr(30.0)).is_ok());
        assert!(validate_readings(&hr(249.9)).is_ok());
        assert_eq!(
            validate_readings(&hr(250.4)),
            Err(ValidationError::HeartRate(250.4))
        );

        let cadence = Readings {
            cadence_spm: Some(300.4),
            ..Readings::default()
        };
        assert_eq!(
            validate_readings(&cadence),
            Err(ValidationError::Cadence(300.4))
        );

        let battery = Readings {
            battery_pct: Some(100.2),
            ..Readings::default()
        };
        assert!(validate_readings(&battery).is_err());
    }

    #[test]
    fn test_nan_is_rejected() {
        let readings = Readings {
            heart_rate_bpm: Some(f64::NAN),
            ..Readings::default()
        };
        assert!(matches!(
            validate_readings(&readings),
            Err(ValidationError::HeartRate(_))
        ));
    }
}
