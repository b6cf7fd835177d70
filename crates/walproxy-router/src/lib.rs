#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **walproxy-router** – the Health & Routing Engine.
//!
//! Chooses a backend per request from the Health Prober's published
//! verdict, and enforces post-write consistency-window stickiness: a
//! collection that just received a write is pinned to the backend that
//! executed it for a short window so an immediate read-after-write isn't
//! routed to a backend that hasn't synced yet.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

use walproxy_health::HealthProber;
use walproxy_types::{BackendName, Error, Result};

/// Default consistency-window duration (`CONSISTENCY_WINDOW_SECONDS`).
pub const DEFAULT_CONSISTENCY_WINDOW: Duration = Duration::from_secs(30);
/// Default fraction of reads routed to the replica (`READ_REPLICA_RATIO`).
pub const DEFAULT_READ_REPLICA_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy)]
struct Pin {
    backend: BackendName,
    expires_at: DateTime<Utc>,
}

/// Chooses a backend for each request and tracks per-collection
/// consistency-window pins.
pub struct Router {
    health: std::sync::Arc<HealthProber>,
    pins: DashMap<String, Pin>,
    read_replica_ratio: f64,
    consistency_window: chrono::Duration,
}

impl Router {
    /// Build a router over the given health prober.
    pub fn new(health: std::sync::Arc<HealthProber>, read_replica_ratio: f64, consistency_window: Duration) -> Self {
        Self {
            health,
            pins: DashMap::new(),
            read_replica_ratio,
            consistency_window: chrono::Duration::from_std(consistency_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    /// Choose a backend for a write: primary if healthy, else replica,
    /// else `NoBackendAvailable`.
    pub fn route_write(&self) -> Result<BackendName> {
        if self.health.is_healthy(BackendName::Primary) {
            Ok(BackendName::Primary)
        } else if self.health.is_healthy(BackendName::Replica) {
            Ok(BackendName::Replica)
        } else {
            Err(Error::NoBackendAvailable)
        }
    }

    /// Pin `collection_id` to `backend` for the consistency window after a
    /// successful write.
    pub fn pin_after_write(&self, collection_id: &str, backend: BackendName) {
        self.pins.insert(
            collection_id.to_string(),
            Pin {
                backend,
                expires_at: Utc::now() + self.consistency_window,
            },
        );
    }

    /// Choose a backend for a read. An active, unexpired consistency-window
    /// pin for `collection_id` overrides the read ratio.
    pub fn route_read(&self, collection_id: Option<&str>) -> Result<BackendName> {
        if let Some(collection_id) = collection_id {
            if let Some(pinned) = self.active_pin(collection_id) {
                if self.health.is_healthy(pinned) {
                    return Ok(pinned);
                }
                debug!(collection_id, backend = %pinned, "pinned backend unhealthy, falling through to ratio routing");
            }
        }

        let primary_up = self.health.is_healthy(BackendName::Primary);
        let replica_up = self.health.is_healthy(BackendName::Replica);
        match (primary_up, replica_up) {
            (false, false) => Err(Error::NoBackendAvailable),
            (true, false) => Ok(BackendName::Primary),
            (false, true) => Ok(BackendName::Replica),
            (true, true) => {
                let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
                Ok(if roll < self.read_replica_ratio {
                    BackendName::Replica
                } else {
                    BackendName::Primary
                })
            }
        }
    }

    fn active_pin(&self, collection_id: &str) -> Option<BackendName> {
        let pin = self.pins.get(collection_id)?;
        if pin.expires_at > Utc::now() {
            Some(pin.backend)
        } else {
            None
        }
    }

    /// Drop expired pins. Not required for correctness (expiry is checked
    /// on read) but keeps the pin map from growing unboundedly busy
    /// workloads; safe to call from a periodic sweep.
    pub fn evict_expired_pins(&self) {
        let now = Utc::now();
        self.pins.retain(|_, pin| pin.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walproxy_types::Backend;

    fn router_with(primary_healthy: bool, replica_healthy: bool) -> Router {
        let health = HealthProber::new(
            vec![
                Backend {
                    healthy: primary_healthy,
                    ..Backend::new(BackendName::Primary, "http://primary".to_string(), 0)
                },
                Backend {
                    healthy: replica_healthy,
                    ..Backend::new(BackendName::Replica, "http://replica".to_string(), 1)
                },
            ],
            3,
        );
        Router::new(std::sync::Arc::new(health), DEFAULT_READ_REPLICA_RATIO, DEFAULT_CONSISTENCY_WINDOW)
    }

    #[test]
    fn write_prefers_primary_when_healthy() {
        let router = router_with(true, true);
        assert_eq!(router.route_write().unwrap(), BackendName::Primary);
    }

    #[test]
    fn write_falls_back_to_replica_when_primary_down() {
        let router = router_with(false, true);
        assert_eq!(router.route_write().unwrap(), BackendName::Replica);
    }

    #[test]
    fn write_fails_when_both_down() {
        let router = router_with(false, false);
        assert!(matches!(router.route_write().unwrap_err(), Error::NoBackendAvailable));
    }

    #[test]
    fn pin_overrides_ratio_routing_within_window() {
        let router = router_with(true, true);
        router.pin_after_write("docs", BackendName::Primary);
        for _ in 0..20 {
            assert_eq!(router.route_read(Some("docs")).unwrap(), BackendName::Primary);
        }
    }

    #[test]
    fn read_falls_back_to_other_backend_when_pinned_one_unhealthy() {
        let router = router_with(false, true);
        router.pin_after_write("docs", BackendName::Primary);
        assert_eq!(router.route_read(Some("docs")).unwrap(), BackendName::Replica);
    }

    #[test]
    fn read_without_pin_respects_ratio_bounds() {
        let router = router_with(true, true);
        let mut replica_count = 0;
        for _ in 0..200 {
            if router.route_read(None).unwrap() == BackendName::Replica {
                replica_count += 1;
            }
        }
        assert!(replica_count > 100, "expected replica-majority routing, got {replica_count}/200");
    }

    #[test]
    fn read_with_single_healthy_backend_always_uses_it() {
        let router = router_with(true, false);
        for _ in 0..10 {
            assert_eq!(router.route_read(None).unwrap(), BackendName::Primary);
        }
    }
}
