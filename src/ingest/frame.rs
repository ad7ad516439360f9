//! Wire frame decoding.
//!
//! The sensor bridge sends one JSON object per message. Sample frames carry
//! sparse readings; heartbeat frames (`"heartbeat": true`) carry only
//! liveness metadata and never produce a [`Sample`].

use crate::core::sample::{ContactStatus, Sample, KPH_PER_MPS};
use crate::core::validate::Readings;
use serde::Deserialize;
use thiserror::Error;

/// Device id used when a frame does not name its device.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Frame decoding failures. Always non-fatal: the frame is counted and dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Contact status as sent by the bridge: a label or the raw BLE code.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ContactField {
    Code(i64),
    Label(String),
}

impl ContactField {
    fn status(&self) -> ContactStatus {
        match self {
            ContactField::Code(code) => ContactStatus::from_code(*code),
            ContactField::Label(label) => ContactStatus::from_label(label),
        }
    }
}

/// Loosely typed frame as it appears on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireFrame {
    source: Option<String>,
    device_id: Option<String>,
    device_name: Option<String>,
    ts_unix_s: Option<f64>,
    seq: Option<u64>,
    heartbeat: bool,
    hr_bpm: Option<f64>,
    rr_s: Option<Vec<f64>>,
    speed_kph: Option<f64>,
    speed_mps: Option<f64>,
    cadence_spm: Option<f64>,
    stride_length_cm: Option<f64>,
    total_distance_m: Option<f64>,
    distance_m: Option<f64>,
    battery_pct: Option<f64>,
    contact_status: Option<ContactField>,
    raw_payload: Option<String>,
    energy_j: Option<f64>,
    connection_attempts: Option<u64>,
    signal_quality: Option<f64>,
}

/// Who sent a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: Option<String>,
    /// Transport tag set by the bridge (e.g. `ble_hr`)
    pub source: Option<String>,
}

/// A decoded sample with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFrame {
    pub device: DeviceInfo,
    pub seq: Option<u64>,
    /// Energy expended counter reported by the strap
    pub energy_j: Option<f64>,
    pub sample: Sample,
    /// Validated fields as received, before rounding
    pub readings: Readings,
}

/// Keep-alive metadata from the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub device_id: String,
    pub timestamp: f64,
    pub seq: Option<u64>,
    pub battery_pct: Option<i32>,
    pub connection_attempts: Option<u64>,
    /// Share of recent notifications carrying RR data, percent
    pub signal_quality: Option<f64>,
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sample(SampleFrame),
    Heartbeat(Heartbeat),
}

impl Frame {
    pub fn device_id(&self) -> &str {
        match self {
            Frame::Sample(frame) => &frame.device.device_id,
            Frame::Heartbeat(heartbeat) => &heartbeat.device_id,
        }
    }
}

/// Decode a text frame. `arrival_time` stands in for a missing `ts_unix_s`.
pub fn decode_frame(text: &str, arrival_time: f64) -> Result<Frame, DecodeError> {
    let wire: WireFrame = serde_json::from_str(text)?;
    build_frame(wire, arrival_time)
}

/// Decode a binary frame carrying UTF-8 JSON.
pub fn decode_frame_bytes(bytes: &[u8], arrival_time: f64) -> Result<Frame, DecodeError> {
    let wire: WireFrame = serde_json::from_slice(bytes)?;
    build_frame(wire, arrival_time)
}

fn build_frame(wire: WireFrame, arrival_time: f64) -> Result<Frame, DecodeError> {
    let timestamp = wire.ts_unix_s.unwrap_or(arrival_time);
    if !timestamp.is_finite() || timestamp < 0.0 {
        return Err(DecodeError::InvalidField {
            field: "ts_unix_s",
            reason: format!("expected a non-negative Unix time, got {timestamp}"),
        });
    }

    let device_id = wire
        .device_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());

    if wire.heartbeat {
        return Ok(Frame::Heartbeat(Heartbeat {
            device_id,
            timestamp,
            seq: wire.seq,
            battery_pct: wire.battery_pct.map(round_i32),
            connection_attempts: wire.connection_attempts,
            signal_quality: wire.signal_quality,
        }));
    }

    let speed_mps = wire
        .speed_kph
        .map(|kph| kph / KPH_PER_MPS)
        .or(wire.speed_mps);
    let readings = Readings {
        heart_rate_bpm: wire.hr_bpm,
        battery_pct: wire.battery_pct,
        speed_mps,
        cadence_spm: wire.cadence_spm,
    };

    let mut sample = Sample {
        timestamp,
        heart_rate_bpm: wire.hr_bpm.map(round_i32),
        rr_intervals: wire.rr_s.unwrap_or_default(),
        hrv_rmssd_ms: None,
        speed_mps,
        cadence_spm: wire.cadence_spm.map(round_i32),
        stride_length_cm: wire.stride_length_cm.map(round_i32),
        total_distance_m: wire.total_distance_m.or(wire.distance_m),
        battery_pct: wire.battery_pct.map(round_i32),
        contact_status: wire
            .contact_status
            .as_ref()
            .map(ContactField::status)
            .unwrap_or_default(),
        is_running: false,
        raw_payload: wire.raw_payload,
    };
    sample.refresh_derived();

    Ok(Frame::Sample(SampleFrame {
        device: DeviceInfo {
            device_id,
            device_name: wire.device_name,
            source: wire.source,
        },
        seq: wire.seq,
        energy_j: wire.energy_j,
        sample,
        readings,
    }))
}

fn round_i32(value: f64) -> i32 {
    value.round() as i32
}
