//! Derived reports over persisted sessions: heart rate zones and activity
//! summaries.

use crate::core::sample::Sample;
use crate::storage::SessionSummary;
use serde::{Deserialize, Serialize};

/// A heart rate band, `[min_bpm, max_bpm)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HrZone {
    pub name: &'static str,
    pub min_bpm: i32,
    pub max_bpm: i32,
}

impl HrZone {
    pub fn contains(&self, bpm: i32) -> bool {
        self.min_bpm <= bpm && bpm < self.max_bpm
    }
}

/// Default five-zone model.
pub const HR_ZONES: [HrZone; 5] = [
    HrZone {
        name: "Recovery",
        min_bpm: 0,
        max_bpm: 110,
    },
    HrZone {
        name: "Easy",
        min_bpm: 110,
        max_bpm: 130,
    },
    HrZone {
        name: "Moderate",
        min_bpm: 130,
        max_bpm: 150,
    },
    HrZone {
        name: "Hard",
        min_bpm: 150,
        max_bpm: 170,
    },
    HrZone {
        name: "Maximum",
        min_bpm: 170,
        max_bpm: 250,
    },
];

/// Share of a session's heart rate samples falling in one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneShare {
    pub name: String,
    pub min_bpm: i32,
    pub max_bpm: i32,
    pub count: u64,
    /// Percentage of heart-rate bearing samples, one decimal
    pub percentage: f64,
    /// Time in zone, assuming one sample per second
    pub seconds: u64,
}

/// Distribute the heart-rate bearing samples over [`HR_ZONES`].
///
/// Readings outside every zone (e.g. exactly 250) count toward the total
/// but no zone.
pub fn hr_zones(samples: &[Sample]) -> Vec<ZoneShare> {
    let heart_rates: Vec<i32> = samples.iter().filter_map(|s| s.heart_rate_bpm).collect();
    let total = heart_rates.len() as u64;

    HR_ZONES
        .iter()
        .map(|zone| {
            let count = heart_rates.iter().filter(|&&hr| zone.contains(hr)).count() as u64;
            let percentage = if total == 0 {
                0.0
            } else {
                (1000.0 * count as f64 / total as f64).round() / 10.0
            };
            ZoneShare {
                name: zone.name.to_string(),
                min_bpm: zone.min_bpm,
                max_bpm: zone.max_bpm,
                count,
                percentage,
                seconds: count,
            }
        })
        .collect()
}

/// Totals over the sessions of a look-back window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub days: u32,
    pub total_sessions: usize,
    /// Sum of `end_time - start_time` over closed sessions
    pub total_duration_secs: f64,
    pub total_samples: u64,
    /// Mean heart rate over every heart-rate bearing sample of the window
    pub avg_hr: Option<f64>,
}

impl ActivitySummary {
    pub fn from_sessions(days: u32, sessions: &[SessionSummary]) -> Self {
        let total_duration_secs = sessions
            .iter()
            .filter_map(|s| s.session.end_time.map(|end| end - s.session.start_time))
            .sum();
        let total_samples = sessions.iter().map(|s| s.sample_count).sum();

        let (weighted, weight) = sessions
            .iter()
            .filter_map(|s| {
                let count = s.hr_sample_count as f64;
                s.avg_hr.map(|hr| (hr * count, count))
            })
            .fold((0.0, 0.0), |(acc, n), (hr, count)| (acc + hr, n + count));

        Self {
            days,
            total_sessions: sessions.len(),
            total_duration_secs,
            total_samples,
            avg_hr: (weight > 0.0).then(|| weighted / weight),
        }
    }
}

/// Render seconds as `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
