//! Fixed-width time bucket summaries over a session's samples.
//!
//! Buckets start at the session's first sample and are laid end to end:
//! `[start, start + w)`, `[start + w, start + 2w)`, ... Only samples with a
//! heart rate qualify; a bucket without any qualifying sample produces no row.

use crate::core::sample::Sample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of one bucket, keyed by `(session_id, interval_start, interval_width)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub session_id: String,
    /// Bucket start (Unix seconds)
    pub interval_start: f64,
    /// Bucket width in seconds
    pub interval_width: u32,
    pub avg_hr: f64,
    pub min_hr: i32,
    pub max_hr: i32,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub avg_cadence: Option<f64>,
    pub max_distance: Option<f64>,
    /// Number of qualifying (heart-rate bearing) samples
    pub sample_count: u32,
}

/// Partition `samples` into buckets of `interval_width` seconds.
///
/// `samples` may be in any order; the first bucket starts at the earliest
/// timestamp. A zero width yields no buckets.
pub fn compute_buckets(
    session_id: &str,
    samples: &[Sample],
    interval_width: u32,
) -> Vec<Aggregate> {
    if interval_width == 0 {
        return Vec::new();
    }

    let Some(start) = samples.iter().map(|s| s.timestamp).reduce(f64::min) else {
        return Vec::new();
    };
    let width = f64::from(interval_width);

    let mut buckets: BTreeMap<u64, Vec<&Sample>> = BTreeMap::new();
    for sample in samples.iter().filter(|s| s.heart_rate_bpm.is_some()) {
        let index = ((sample.timestamp - start) / width).floor() as u64;
        buckets.entry(index).or_default().push(sample);
    }

    buckets
        .into_iter()
        .filter_map(|(index, members)| {
            summarize(session_id, start + index as f64 * width, interval_width, &members)
        })
        .collect()
}

fn summarize(
    session_id: &str,
    interval_start: f64,
    interval_width: u32,
    members: &[&Sample],
) -> Option<Aggregate> {
    let heart_rates: Vec<i32> = members.iter().filter_map(|s| s.heart_rate_bpm).collect();
    let min_hr = *heart_rates.iter().min()?;
    let max_hr = *heart_rates.iter().max()?;
    let avg_hr =
        statrs::statistics::Statistics::mean(heart_rates.iter().map(|&hr| f64::from(hr)));

    let speeds: Vec<f64> = members.iter().filter_map(|s| s.speed_mps).collect();
    let cadences: Vec<f64> = members
        .iter()
        .filter_map(|s| s.cadence_spm.map(f64::from))
        .collect();
    let distances: Vec<f64> = members.iter().filter_map(|s| s.total_distance_m).collect();

    Some(Aggregate {
        session_id: session_id.to_string(),
        interval_start,
        interval_width,
        avg_hr,
        min_hr,
        max_hr,
        avg_speed: mean_of(&speeds),
        max_speed: max_of(&speeds),
        avg_cadence: mean_of(&cadences),
        max_distance: max_of(&distances),
        sample_count: heart_rates.len() as u32,
    })
}

fn mean_of(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| statrs::statistics::Statistics::mean(values))
}

fn max_of(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| statrs::statistics::Statistics::max(values))
}
