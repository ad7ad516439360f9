//! Normalized physiological sample records.
//!
//! A [`Sample`] is one reading from a heart rate / running dynamics sensor.
//! Every field apart from the timestamp is optional: sensors report sparsely
//! and an absent field is "unset", never zero.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Speed above which a sample counts as running (m/s, exclusive).
pub const RUNNING_SPEED_MPS: f64 = 2.0;

/// Cadence above which a sample counts as running (steps/min, exclusive).
pub const RUNNING_CADENCE_SPM: i32 = 120;

/// Conversion factor between km/h and m/s.
pub const KPH_PER_MPS: f64 = 3.6;

/// Skin contact state reported by the strap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    /// The sensor does not report contact
    #[default]
    Unsupported,
    /// Supported, but the strap is not touching skin
    NoContact,
    /// Supported and detected
    GoodContact,
}

impl ContactStatus {
    /// Map a textual label from the bridge. Unknown labels map to `Unsupported`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "N/A" => ContactStatus::Unsupported,
            "No Contact" => ContactStatus::NoContact,
            "Good Contact" => ContactStatus::GoodContact,
            _ => ContactStatus::Unsupported,
        }
    }

    /// Map the two-bit BLE contact code (2 and 3 both mean detected).
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ContactStatus::NoContact,
            2 | 3 => ContactStatus::GoodContact,
            _ => ContactStatus::Unsupported,
        }
    }

    /// Integer code used in storage.
    pub fn code(self) -> i64 {
        match self {
            ContactStatus::Unsupported => 0,
            ContactStatus::NoContact => 1,
            ContactStatus::GoodContact => 2,
        }
    }
}

/// One physiological reading at a point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in seconds
    pub timestamp: f64,
    pub heart_rate_bpm: Option<i32>,
    /// RR intervals in seconds, in arrival order
    #[serde(default)]
    pub rr_intervals: Vec<f64>,
    /// RMSSD over `rr_intervals`, in milliseconds
    pub hrv_rmssd_ms: Option<f64>,
    pub speed_mps: Option<f64>,
    pub cadence_spm: Option<i32>,
    pub stride_length_cm: Option<i32>,
    pub total_distance_m: Option<f64>,
    pub battery_pct: Option<i32>,
    #[serde(default)]
    pub contact_status: ContactStatus,
    pub is_running: bool,
    /// Opaque diagnostic blob (hex string from the bridge)
    pub raw_payload: Option<String>,
}

impl Sample {
    /// Create an empty sample at the given timestamp.
    pub fn at(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    /// Builder-style heart rate setter.
    pub fn with_heart_rate(mut self, bpm: i32) -> Self {
        self.heart_rate_bpm = Some(bpm);
        self
    }

    /// Builder-style speed setter; recomputes the running flag.
    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self.refresh_derived();
        self
    }

    /// Builder-style cadence setter; recomputes the running flag.
    pub fn with_cadence(mut self, cadence_spm: i32) -> Self {
        self.cadence_spm = Some(cadence_spm);
        self.refresh_derived();
        self
    }

    /// Builder-style RR interval setter; recomputes HRV.
    pub fn with_rr_intervals(mut self, rr_intervals: Vec<f64>) -> Self {
        self.rr_intervals = rr_intervals;
        self.refresh_derived();
        self
    }

    /// Recompute the derived fields (`is_running`, `hrv_rmssd_ms`).
    pub fn refresh_derived(&mut self) {
        self.is_running = is_running(self.speed_mps, self.cadence_spm);
        self.hrv_rmssd_ms = rmssd_ms(&self.rr_intervals);
    }
}

/// Running detection: strictly faster than 2.0 m/s or strictly above 120 spm.
pub fn is_running(speed_mps: Option<f64>, cadence_spm: Option<i32>) -> bool {
    speed_mps.unwrap_or(0.0) > RUNNING_SPEED_MPS || cadence_spm.unwrap_or(0) > RUNNING_CADENCE_SPM
}

/// Root mean square of successive RR differences, in milliseconds.
///
/// Returns `None` with fewer than two intervals.
pub fn rmssd_ms(rr_intervals: &[f64]) -> Option<f64> {
    if rr_intervals.len() < 2 {
        return None;
    }

    let diffs: Vec<f64> = rr_intervals
        .windows(2)
        .map(|pair| pair[1] * 1000.0 - pair[0] * 1000.0)
        .collect();

    Some(diffs.iter().quadratic_mean())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmssd_constant_intervals() {
        let rmssd = rmssd_ms(&[1.0, 1.0, 1.0]).unwrap();
        assert!(rmssd.abs() < 1e-9);
    }

    #[test]
    fn test_rmssd_single_difference() {
        let rmssd = rmssd_ms(&[0.8, 1.0]).unwrap();
        assert!((rmssd - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_rmssd_needs_two_intervals() {
        assert_eq!(rmssd_ms(&[]), None);
        assert_eq!(rmssd_ms(&[0.9]), None);
    }

    #[test]
    fn test_rmssd_multiple_differences() {
        // diffs: +100, -100 => sqrt((10000 + 10000) / 2) = 100
        let rmssd = rmssd_ms(&[0.8, 0.9, 0.8]).unwrap();
        assert!((rmssd - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_is_running_boundaries() {
        assert!(is_running(Some(2.5), Some(0)));
        assert!(!is_running(Some(2.0), Some(0)));
        assert!(is_running(Some(0.0), Some(121)));
        assert!(!is_running(Some(0.0), Some(120)));
        assert!(!is_running(None, None));
    }

    #[test]
    fn test_contact_status_mapping() {
        assert_eq!(ContactStatus::from_label("N/A"), ContactStatus::Unsupported);
        assert_eq!(ContactStatus::from_label("No Contact"), ContactStatus::NoContact);
        assert_eq!(ContactStatus::from_label("Good Contact"), ContactStatus::GoodContact);
        assert_eq!(ContactStatus::from_label("sweaty"), ContactStatus::Unsupported);
        assert_eq!(ContactStatus::from_code(3), ContactStatus::GoodContact);
        assert_eq!(ContactStatus::from_code(9), ContactStatus::Unsupported);
    }

    #[test]
    fn test_builder_refreshes_derived_fields() {
        let sample = Sample::at(10.0)
            .with_heart_rate(150)
            .with_speed(3.0)
            .with_rr_intervals(vec![0.4, 0.5]);
        assert!(sample.is_running);
        assert!(sample.hrv_rmssd_ms.is_some());
        assert_eq!(sample.heart_rate_bpm, Some(150));
    }
}
