//! Device to session attribution with inactivity-gap closure.
//!
//! The manager tracks, for each device believed to have an open session, the
//! session id and the arrival time of the last sample attributed to it. A
//! session closes once more than `gap_seconds` pass without activity; the
//! comparison is strict, so activity exactly `gap_seconds` later continues
//! the session.
//!
//! Closure is found lazily (the device sends again after the gap) or eagerly
//! via [`SessionManager::sweep`]. Either way the stored `end_time` is the
//! last activity time, not the time the closure was noticed.

use crate::storage::{SessionRecord, StorageError, Store};
use std::collections::HashMap;
use uuid::Uuid;

/// Default inactivity gap (5 minutes).
pub const DEFAULT_GAP_SECONDS: f64 = 300.0;

#[derive(Debug, Clone, PartialEq)]
struct ActiveSession {
    session_id: String,
    device_name: Option<String>,
    last_activity: f64,
}

/// How a session id was obtained by [`SessionManager::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOrigin {
    /// Still within the gap of the in-memory session
    Continued,
    /// Open session found in storage (e.g. after a restart)
    Adopted {
        /// Newest persisted sample, used to seed the replay watermark
        last_sample_at: Option<f64>,
    },
    /// Freshly created
    Created,
}

/// A session the manager just closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedSession {
    pub session_id: String,
    pub device_id: String,
    pub end_time: f64,
}

/// Result of resolving a device to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub session_id: String,
    pub origin: SessionOrigin,
    /// Previous session of the same device closed by this call
    pub closed: Option<ClosedSession>,
}

/// Owns the device to open-session map.
#[derive(Debug)]
pub struct SessionManager {
    gap_seconds: f64,
    active: HashMap<String, ActiveSession>,
}

impl SessionManager {
    pub fn new(gap_seconds: f64) -> Self {
        Self {
            gap_seconds,
            active: HashMap::new(),
        }
    }

    pub fn gap_seconds(&self) -> f64 {
        self.gap_seconds
    }

    /// Map a device's sample arriving at `arrival_time` to a session id.
    ///
    /// Storage failures leave the in-memory map as it was before the call,
    /// apart from a closure that already reached storage.
    pub async fn resolve(
        &mut self,
        store: &dyn Store,
        device_id: &str,
        device_name: Option<&str>,
        arrival_time: f64,
    ) -> Result<Resolution, StorageError> {
        let mut closed = None;

        if let Some(active) = self.active.get_mut(device_id) {
            if arrival_time - active.last_activity <= self.gap_seconds {
                active.last_activity = arrival_time.max(active.last_activity);
                if active.device_name.is_none() {
                    active.device_name = device_name.map(str::to_owned);
                }
                return Ok(Resolution {
                    session_id: active.session_id.clone(),
                    origin: SessionOrigin::Continued,
                    closed: None,
                });
            }
            closed = Some(self.close(store, device_id).await?);
        }

        let active_since = arrival_time - self.gap_seconds;
        if let Some(open) = store.find_open_session(device_id, active_since).await? {
            tracing::info!(
                session_id = %open.session_id,
                device_id,
                "resuming open session from storage"
            );
            self.active.insert(
                device_id.to_string(),
                ActiveSession {
                    session_id: open.session_id.clone(),
                    device_name: open.device_name.or_else(|| device_name.map(str::to_owned)),
                    last_activity: arrival_time,
                },
            );
            return Ok(Resolution {
                session_id: open.session_id,
                origin: SessionOrigin::Adopted {
                    last_sample_at: open.last_sample_at,
                },
                closed,
            });
        }

        let session_id = Uuid::new_v4().to_string();
        store
            .create_session(&SessionRecord {
                session_id: session_id.clone(),
                device_id: device_id.to_string(),
                device_name: device_name.map(str::to_owned),
                start_time: arrival_time,
                end_time: None,
            })
            .await?;
        tracing::info!(
            session_id = %session_id,
            device_id,
            device_name = device_name.unwrap_or("unknown"),
            start_time = arrival_time,
            "session started"
        );
        self.active.insert(
            device_id.to_string(),
            ActiveSession {
                session_id: session_id.clone(),
                device_name: device_name.map(str::to_owned),
                last_activity: arrival_time,
            },
        );

        Ok(Resolution {
            session_id,
            origin: SessionOrigin::Created,
            closed,
        })
    }

    /// Close every session idle for longer than the gap at `now`.
    ///
    /// A storage failure on one session is logged and the session stays
    /// tracked, so the next sweep retries it.
    pub async fn sweep(&mut self, store: &dyn Store, now: f64) -> Vec<ClosedSession> {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, active)| now - active.last_activity > self.gap_seconds)
            .map(|(device_id, _)| device_id.clone())
            .collect();

        let mut closed = Vec::with_capacity(expired.len());
        for device_id in expired {
            match self.close(store, &device_id).await {
                Ok(session) => closed.push(session),
                Err(error) => tracing::error!(
                    device_id = %device_id,
                    error = %error,
                    "failed to close inactive session"
                ),
            }
        }
        closed
    }

    /// Close every tracked session at its last activity time (shutdown).
    pub async fn close_all(&mut self, store: &dyn Store) -> Vec<ClosedSession> {
        let devices: Vec<String> = self.active.keys().cloned().collect();
        let mut closed = Vec::with_capacity(devices.len());
        for device_id in devices {
            match self.close(store, &device_id).await {
                Ok(session) => closed.push(session),
                Err(error) => {
                    tracing::error!(
                        device_id = %device_id,
                        error = %error,
                        "failed to close session on shutdown"
                    );
                    // Give up on it; storage keeps it open and a restart adopts it.
                    self.active.remove(&device_id);
                }
            }
        }
        closed
    }

    async fn close(
        &mut self,
        store: &dyn Store,
        device_id: &str,
    ) -> Result<ClosedSession, StorageError> {
        let Some(active) = self.active.get(device_id) else {
            return Err(StorageError::NotFound {
                session_id: device_id.to_string(),
            });
        };

        let end_time = active.last_activity;
        let session_id = active.session_id.clone();
        let updated = store.close_session(&session_id, end_time).await?;
        if !updated {
            tracing::warn!(session_id = %session_id, device_id, "session was already closed in storage");
        }
        self.active.remove(device_id);

        tracing::info!(session_id = %session_id, device_id, end_time, "session closed");
        Ok(ClosedSession {
            session_id,
            device_id: device_id.to_string(),
            end_time,
        })
    }

    /// Session currently attributed to a device.
    pub fn session_for(&self, device_id: &str) -> Option<&str> {
        self.active.get(device_id).map(|a| a.session_id.as_str())
    }

    /// Ids of every open session.
    pub fn active_sessions(&self) -> Vec<String> {
        self.active.values().map(|a| a.session_id.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_GAP_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sample::Sample;
    use crate::storage::LibsqlStore;

    async fn store() -> LibsqlStore {
        LibsqlStore::open_in_memory().await.expect("open")
    }

    #[tokio::test]
    async fn test_resolve_is_stable_within_gap() {
        let store = store().await;
        let mut manager = SessionManager::new(300.0);

        let first = manager.resolve(&store, "D1", Some("H10"), 0.0).await.unwrap();
        assert_eq!(first.origin, SessionOrigin::Created);
        for t in [1.0, 100.0, 400.0] {
            let next = manager.resolve(&store, "D1", None, t).await.unwrap();
            assert_eq!(next.session_id, first.session_id);
            assert_eq!(next.origin, SessionOrigin::Continued);
        }
    }

    #[tokio::test]
    async fn test_gap_boundary_is_strict() {
        let store = store().await;
        let mut manager = SessionManager::new(300.0);

        let a = manager.resolve(&store, "D1", None, 0.0).await.unwrap();
        let b = manager.resolve(&store, "D1", None, 300.0).await.unwrap();
        assert_eq!(a.session_id, b.session_id);
    }

    #[tokio::test]
    async fn test_gap_exceeded_closes_at_last_activity() {
        let store = store().await;
        let mut manager = SessionManager::new(300.0);

        let a = manager.resolve(&store, "D1", None, 0.0).await.unwrap();
        manager.resolve(&store, "D1", None, 10.0).await.unwrap();
        let b = manager.resolve(&store, "D1", None, 311.0).await.unwrap();

        assert_ne!(a.session_id, b.session_id);
        assert_eq!(b.origin, SessionOrigin::Created);
        let closed = b.closed.expect("previous session closed");
        assert_eq!(closed.session_id, a.session_id);
        assert_eq!(closed.end_time, 10.0);

        let stored = store.get_session(&a.session_id).await.unwrap().unwrap();
        assert_eq!(stored.end_time, Some(10.0));
        let fresh = store.get_session(&b.session_id).await.unwrap().unwrap();
        assert_eq!(fresh.start_time, 311.0);
        assert_eq!(fresh.end_time, None);
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_devices_only() {
        let store = store().await;
        let mut manager = SessionManager::new(300.0);

        let idle = manager.resolve(&store, "D1", None, 0.0).await.unwrap();
        manager.resolve(&store, "D2", None, 200.0).await.unwrap();

        assert!(manager.sweep(&store, 300.0).await.is_empty());
        let closed = manager.sweep(&store, 301.0).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].session_id, idle.session_id);
        assert_eq!(closed[0].end_time, 0.0);
        assert_eq!(manager.active_count(), 1);
        assert!(manager.session_for("D1").is_none());
    }

    #[tokio::test]
    async fn test_adopts_open_session_from_storage() {
        let store = store().await;
        let mut before_restart = SessionManager::new(300.0);
        let original = before_restart
            .resolve(&store, "D1", None, 1000.0)
            .await
            .unwrap();
        store
            .insert_samples(&original.session_id, &[Sample::at(1005.0).with_heart_rate(90)])
            .await
            .unwrap();

        let mut after_restart = SessionManager::new(300.0);
        let resumed = after_restart
            .resolve(&store, "D1", None, 1200.0)
            .await
            .unwrap();
        assert_eq!(resumed.session_id, original.session_id);
        assert_eq!(
            resumed.origin,
            SessionOrigin::Adopted {
                last_sample_at: Some(1005.0)
            }
        );
    }

    #[tokio::test]
    async fn test_stale_storage_session_not_adopted() {
        let store = store().await;
        let mut before_restart = SessionManager::new(300.0);
        let original = before_restart.resolve(&store, "D1", None, 0.0).await.unwrap();

        let mut after_restart = SessionManager::new(300.0);
        let fresh = after_restart.resolve(&store, "D1", None, 5000.0).await.unwrap();
        assert_ne!(fresh.session_id, original.session_id);

        // Only one open session per device in storage.
        let stale = store.get_session(&original.session_id).await.unwrap().unwrap();
        assert_eq!(stale.end_time, Some(0.0));
    }

    #[tokio::test]
    async fn test_close_all() {
        let store = store().await;
        let mut manager = SessionManager::new(300.0);
        manager.resolve(&store, "D1", None, 0.0).await.unwrap();
        manager.resolve(&store, "D2", None, 5.0).await.unwrap();

        let closed = manager.close_all(&store).await;
        assert_eq!(closed.len(), 2);
        assert_eq!(manager.active_count(), 0);
    }
}
