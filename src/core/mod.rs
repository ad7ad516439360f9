//! Session-lifecycle and buffering core.
//!
//! This module contains:
//! - Normalized sample records and derived metrics (running flag, RMSSD)
//! - Physiological range validation
//! - Per-session dedup buffers
//! - Device to session attribution with gap-based closure
//! - Fixed-width aggregate buckets and derived reports

pub mod aggregate;
pub mod buffer;
pub mod report;
pub mod sample;
pub mod session;
pub mod validate;

pub use aggregate::{compute_buckets, Aggregate};
pub use buffer::{Offer, SampleBuffer};
pub use report::{format_duration, hr_zones, ActivitySummary, ZoneShare, HR_ZONES};
pub use sample::{is_running, rmssd_ms, ContactStatus, Sample};
pub use session::{ClosedSession, Resolution, SessionManager, SessionOrigin};
pub use validate::{validate, validate_readings, Readings, ValidationError};
