#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **walproxy-health** – the Health Prober.
//!
//! A single background task hits each backend's liveness path on a fixed
//! interval and publishes a cached health verdict that every request
//! consults on its fast path. State transitions require `failure_threshold`
//! consecutive failures to flip a backend down, and a single success to
//! flip it back up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use walproxy_types::{Backend, BackendName};

/// Probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default prober tick interval (`CHECK_INTERVAL`).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Default consecutive-failure threshold (`FAILURE_THRESHOLD`).
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// A backend flipping healthy or unhealthy, emitted to whoever is
/// listening (the Routing Engine, observability surface).
#[derive(Debug, Clone, Copy)]
pub struct HealthTransition {
    /// Which backend transitioned.
    pub backend: BackendName,
    /// The new health state.
    pub healthy: bool,
}

/// Publishes the cached health verdict for both backends and runs the
/// periodic liveness probe against each.
pub struct HealthProber {
    client: reqwest::Client,
    backends: Arc<DashMap<BackendName, Backend>>,
    failure_threshold: u32,
    probe_path: String,
    events: broadcast::Sender<HealthTransition>,
}

impl HealthProber {
    /// Build a prober seeded with the configured backends, all assumed
    /// healthy until the first probe.
    pub fn new(backends: Vec<Backend>, failure_threshold: u32) -> Self {
        let map = DashMap::new();
        for backend in backends {
            map.insert(backend.name, backend);
        }
        let (tx, _rx) = broadcast::channel(64);
        Self {
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("reqwest client with timeout"),
            backends: Arc::new(map),
            failure_threshold,
            probe_path: "/api/v2/version".to_string(),
            events: tx,
        }
    }

    /// Subscribe to health transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.events.subscribe()
    }

    /// Current published health, `false` if the backend is unknown.
    pub fn is_healthy(&self, name: BackendName) -> bool {
        self.backends.get(&name).map(|b| b.healthy).unwrap_or(false)
    }

    /// Snapshot of the full backend table, for `/status`.
    pub fn snapshot(&self) -> Vec<Backend> {
        self.backends.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Names of currently healthy backends.
    pub fn healthy_backends(&self) -> Vec<BackendName> {
        self.backends
            .iter()
            .filter(|entry| entry.value().healthy)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Run the prober forever at `interval`, probing every backend each
    /// tick.
    pub async fn run(&self, interval: Duration) -> ! {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.probe_once().await;
        }
    }

    /// Probe every backend exactly once, updating and returning any state
    /// transitions. Exposed separately from [`Self::run`] so tests can
    /// drive a tick without sleeping on the real interval.
    pub async fn probe_once(&self) -> Vec<HealthTransition> {
        let names: Vec<BackendName> = self.backends.iter().map(|e| *e.key()).collect();
        let mut transitions = Vec::new();
        for name in names {
            if let Some(transition) = self.probe_backend(name).await {
                transitions.push(transition);
                let _ = self.events.send(transition);
            }
        }
        transitions
    }

    async fn probe_backend(&self, name: BackendName) -> Option<HealthTransition> {
        let base_url = self.backends.get(&name)?.base_url.clone();
        let url = format!("{}{}", base_url.trim_end_matches('/'), self.probe_path);
        let outcome = self.client.get(&url).send().await;
        let succeeded = matches!(&outcome, Ok(resp) if resp.status().is_success());

        if let Err(err) = &outcome {
            debug!(backend = %name, error = %err, "probe failed");
        }

        let mut entry = self.backends.get_mut(&name)?;
        entry.last_probe_at = Some(Utc::now());

        if succeeded {
            entry.consecutive_successes += 1;
            entry.consecutive_failures = 0;
            if !entry.healthy {
                entry.healthy = true;
                entry.last_transition_at = Some(Utc::now());
                info!(backend = %name, "backend transitioned to healthy");
                return Some(HealthTransition { backend: name, healthy: true });
            }
        } else {
            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;
            if entry.healthy && entry.consecutive_failures >= self.failure_threshold {
                entry.healthy = false;
                entry.last_transition_at = Some(Utc::now());
                warn!(
                    backend = %name,
                    consecutive_failures = entry.consecutive_failures,
                    "backend transitioned to unhealthy"
                );
                return Some(HealthTransition { backend: name, healthy: false });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: BackendName, base_url: &str) -> Backend {
        Backend::new(name, base_url.to_string(), 0)
    }

    #[tokio::test]
    async fn single_failure_does_not_flip_below_threshold() {
        let prober = HealthProber::new(
            vec![backend(BackendName::Primary, "http://127.0.0.1:1")],
            3,
        );
        let transitions = prober.probe_once().await;
        assert!(transitions.is_empty());
        assert!(prober.is_healthy(BackendName::Primary));
    }

    #[tokio::test]
    async fn threshold_consecutive_failures_flips_down() {
        let prober = HealthProber::new(
            vec![backend(BackendName::Primary, "http://127.0.0.1:1")],
            2,
        );
        prober.probe_once().await;
        let transitions = prober.probe_once().await;
        assert_eq!(transitions.len(), 1);
        assert!(!transitions[0].healthy);
        assert!(!prober.is_healthy(BackendName::Primary));
    }

    #[tokio::test]
    async fn unknown_backend_reports_unhealthy() {
        let prober = HealthProber::new(vec![], 3);
        assert!(!prober.is_healthy(BackendName::Replica));
        assert!(prober.healthy_backends().is_empty());
    }
}
