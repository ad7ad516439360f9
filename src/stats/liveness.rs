//! Per-device liveness bookkeeping fed by heartbeat and sample frames.

use crate::ingest::frame::Heartbeat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Last known state of one device's bridge connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceLiveness {
    pub last_seen: f64,
    pub battery_pct: Option<i32>,
    pub connection_attempts: Option<u64>,
    pub signal_quality: Option<f64>,
    pub heartbeats: u64,
}

/// Liveness for every device seen since start.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    devices: Mutex<BTreeMap<String, DeviceLiveness>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let entry = devices.entry(heartbeat.device_id.clone()).or_default();
        entry.last_seen = entry.last_seen.max(heartbeat.timestamp);
        entry.heartbeats += 1;
        if heartbeat.battery_pct.is_some() {
            entry.battery_pct = heartbeat.battery_pct;
        }
        if heartbeat.connection_attempts.is_some() {
            entry.connection_attempts = heartbeat.connection_attempts;
        }
        if heartbeat.signal_quality.is_some() {
            entry.signal_quality = heartbeat.signal_quality;
        }
    }

    /// Sample frames also prove the device is alive.
    pub fn record_sample(&self, device_id: &str, timestamp: f64, battery_pct: Option<i32>) {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let entry = devices.entry(device_id.to_string()).or_default();
        entry.last_seen = entry.last_seen.max(timestamp);
        if battery_pct.is_some() {
            entry.battery_pct = battery_pct;
        }
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceLiveness> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.get(device_id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, DeviceLiveness> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// One line per device for the status block.
    pub fn summary(&self, now: f64) -> String {
        let devices = self.snapshot();
        if devices.is_empty() {
            return "Devices: none seen".to_string();
        }
        let mut lines = vec!["Devices:".to_string()];
        for (device_id, liveness) in devices {
            let battery = liveness
                .battery_pct
                .map(|b| format!("{b}%"))
                .unwrap_or_else(|| "n/a".to_string());
            let signal = liveness
                .signal_quality
                .map(|q| format!("{q:.0}%"))
                .unwrap_or_else(|| "n/a".to_string());
            lines.push(format!(
                "- {device_id}: last seen {:.0}s ago, battery {battery}, signal {signal}, heartbeats {}",
                (now - liveness.last_seen).max(0.0),
                liveness.heartbeats
            ));
        }
        lines.join("\n")
    }
}
