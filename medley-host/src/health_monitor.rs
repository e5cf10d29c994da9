//! # Health Monitor Module
//!
//! Owns the per-plugin [`HealthState`] records and their circuit breakers,
//! and runs the periodic probe loop. Request recording through
//! [`HealthMonitor::record_request`] is the single source of truth for the
//! breaker; the probe loop is only a liveness floor that keeps the health
//! windows moving for idle plugins.
//!
//! All state is owned here. Callers receive snapshots by copy; supervisors,
//! the facade, and the reload controller never hold references into the
//! maps.

use dashmap::DashMap;
use medley_plugin_sdk::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics,
};
use medley_plugin_sdk::error::RuntimeError;
use medley_plugin_sdk::health::{HealthSnapshot, HealthState, HealthThresholds};
use medley_plugin_sdk::supervisor::{RuntimeState, Supervisor};
use medley_plugin_sdk::wire::ResourceMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Probe-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// How often every registered plugin is probed
    #[serde(with = "medley_plugin_sdk::duration_serde")]
    pub probe_interval: Duration,
    /// Per-probe deadline
    #[serde(with = "medley_plugin_sdk::duration_serde")]
    pub probe_timeout: Duration,
    /// Classification ceilings
    pub thresholds: HealthThresholds,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Per-plugin health records and breakers behind shared maps.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    breaker_config: CircuitBreakerConfig,
    states: DashMap<String, HealthState>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breaker_config,
            states: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Create the health record and breaker for a plugin instance.
    pub fn register(&self, plugin_id: &str) {
        self.states
            .entry(plugin_id.to_string())
            .or_insert_with(HealthState::new);
        self.breaker(plugin_id);
    }

    /// Drop all monitoring resources for a plugin instance.
    ///
    /// Re-registering afterwards starts from zeroed windows and a closed
    /// breaker.
    pub fn unregister(&self, plugin_id: &str) {
        self.states.remove(plugin_id);
        self.breakers.remove(plugin_id);
    }

    pub fn is_registered(&self, plugin_id: &str) -> bool {
        self.states.contains_key(plugin_id)
    }

    fn breaker(&self, plugin_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(plugin_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    plugin_id.to_string(),
                    self.breaker_config.clone(),
                ))
            })
            .clone()
    }

    /// Breaker gate, consulted before every outbound call.
    pub async fn allow(&self, plugin_id: &str) -> bool {
        self.breaker(plugin_id).allow_request().await
    }

    /// Per-call deadline the facade applies on gated requests.
    pub fn request_timeout(&self) -> Duration {
        self.breaker_config.request_timeout
    }

    /// Account a call the breaker refused. Never a breaker failure.
    pub fn record_blocked(&self, plugin_id: &str) {
        if let Some(mut state) = self.states.get_mut(plugin_id) {
            state.record_blocked();
        }
    }

    /// Record one host-originated request outcome.
    ///
    /// The caller must not route `CircuitOpen` or `NotImplemented` outcomes
    /// here; those are excluded from failure accounting by contract.
    pub async fn record_request(
        &self,
        plugin_id: &str,
        success: bool,
        duration: Duration,
        error: Option<&RuntimeError>,
    ) {
        let error_text = error.map(|e| e.to_string());
        {
            let mut state = self
                .states
                .entry(plugin_id.to_string())
                .or_insert_with(HealthState::new);
            state.record_request(
                success,
                duration,
                error_text.as_deref(),
                &self.config.thresholds,
            );
        }
        let breaker = self.breaker(plugin_id);
        if success {
            breaker.record_success().await;
        } else {
            breaker.record_failure().await;
        }
    }

    /// Record one probe outcome. Probes never touch the breaker.
    pub fn record_probe(
        &self,
        plugin_id: &str,
        success: bool,
        duration: Duration,
        error: Option<&str>,
    ) {
        if let Some(mut state) = self.states.get_mut(plugin_id) {
            state.record_probe(success, duration, error, &self.config.thresholds);
        }
    }

    /// Fold in extended resource metrics.
    pub fn record_resources(&self, plugin_id: &str, metrics: ResourceMetrics) {
        if let Some(mut state) = self.states.get_mut(plugin_id) {
            state.record_resources(metrics, &self.config.thresholds);
        }
    }

    /// Copy of one plugin's health record.
    pub fn snapshot(&self, plugin_id: &str) -> Option<HealthSnapshot> {
        self.states.get(plugin_id).map(|s| s.snapshot(plugin_id))
    }

    /// Copies of every health record, sorted by plugin id.
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut all: Vec<HealthSnapshot> = self
            .states
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        all.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        all
    }

    pub fn last_activity(&self, plugin_id: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        self.states
            .get(plugin_id)
            .and_then(|s| s.last_activity_at())
    }

    /// Breaker counters for every plugin, sorted by name.
    pub async fn breaker_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut all = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            all.push(breaker.metrics().await);
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Explicit reset: zero the windows, close the breaker.
    pub async fn reset(&self, plugin_id: &str) {
        self.states
            .insert(plugin_id.to_string(), HealthState::new());
        if let Some(breaker) = self.breakers.get(plugin_id).map(|b| b.clone()) {
            breaker.reset().await;
        }
    }

    /// Run the periodic probe loop until cancelled.
    ///
    /// Each tick probes every running plugin concurrently and waits for the
    /// batch; a hung plugin costs its own probe timeout, not the tick, and
    /// no probe outlives the loop.
    pub async fn run_probe_loop(
        &self,
        supervisors: Arc<DashMap<String, Arc<Supervisor>>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("probe loop cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let targets: Vec<(String, Arc<Supervisor>)> = supervisors
                .iter()
                .filter(|e| e.value().runtime_state() == RuntimeState::Running)
                .filter(|e| self.is_registered(e.key()))
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();

            let probes = targets
                .iter()
                .map(|(plugin_id, supervisor)| self.probe_one(plugin_id, supervisor));
            futures::future::join_all(probes).await;
        }
    }

    async fn probe_one(&self, plugin_id: &str, supervisor: &Supervisor) {
        let Some(client) = supervisor.client().await else {
            return;
        };
        let started = std::time::Instant::now();
        let outcome = client.health_with_timeout(self.config.probe_timeout).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                self.record_probe(plugin_id, true, elapsed, None);
            }
            Err(e) => {
                tracing::warn!(plugin = %plugin_id, "health probe failed: {e}");
                self.record_probe(plugin_id, false, elapsed, Some(&e.to_string()));
                return;
            }
        }

        // Extended metrics are optional; absence is not a failure.
        match client.resource_metrics(self.config.probe_timeout).await {
            Ok(metrics) => self.record_resources(plugin_id, metrics),
            Err(RuntimeError::NotImplemented { .. }) => {}
            Err(e) => {
                tracing::debug!(plugin = %plugin_id, "metrics probe failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_plugin_sdk::circuit_breaker::CircuitState;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            HealthMonitorConfig::default(),
            CircuitBreakerConfig::default(),
        )
    }

    #[tokio::test]
    async fn accounting_invariant_holds() {
        let monitor = monitor();
        monitor.register("p");
        for _ in 0..6 {
            monitor
                .record_request("p", true, Duration::from_millis(10), None)
                .await;
        }
        monitor
            .record_request(
                "p",
                false,
                Duration::from_millis(10),
                Some(&RuntimeError::RequestTimeout),
            )
            .await;
        monitor.record_blocked("p");

        let snap = monitor.snapshot("p").unwrap();
        assert_eq!(snap.total_requests, 7);
        assert_eq!(snap.total_successes + snap.total_failures, 7);
        assert_eq!(snap.blocked_requests, 1);
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_gate() {
        let monitor = monitor();
        monitor.register("p");
        for _ in 0..5 {
            assert!(monitor.allow("p").await);
            monitor
                .record_request(
                    "p",
                    false,
                    Duration::from_millis(5),
                    Some(&RuntimeError::RequestTimeout),
                )
                .await;
        }
        assert!(!monitor.allow("p").await);

        let metrics = monitor.breaker_metrics().await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn probes_do_not_move_the_breaker() {
        let monitor = monitor();
        monitor.register("p");
        for _ in 0..20 {
            monitor.record_probe("p", false, Duration::from_millis(5), Some("down"));
        }
        assert!(monitor.allow("p").await, "probe failures must not open the breaker");
        let snap = monitor.snapshot("p").unwrap();
        assert_eq!(snap.consecutive_failures, 20);
        assert_eq!(snap.total_requests, 0);
    }

    #[tokio::test]
    async fn unregister_then_register_starts_clean() {
        let monitor = monitor();
        monitor.register("p");
        for _ in 0..5 {
            monitor
                .record_request(
                    "p",
                    false,
                    Duration::from_millis(5),
                    Some(&RuntimeError::RequestTimeout),
                )
                .await;
        }
        assert!(!monitor.allow("p").await);

        monitor.unregister("p");
        assert!(!monitor.is_registered("p"));
        monitor.register("p");
        assert!(monitor.allow("p").await, "fresh instance starts closed");
        assert_eq!(monitor.snapshot("p").unwrap().total_requests, 0);
    }

    #[tokio::test]
    async fn explicit_reset_zeroes_everything() {
        let monitor = monitor();
        monitor.register("p");
        for _ in 0..5 {
            monitor
                .record_request(
                    "p",
                    false,
                    Duration::from_millis(5),
                    Some(&RuntimeError::RequestTimeout),
                )
                .await;
        }
        monitor.reset("p").await;
        assert!(monitor.allow("p").await);
        assert_eq!(monitor.snapshot("p").unwrap().total_failures, 0);
    }
}
