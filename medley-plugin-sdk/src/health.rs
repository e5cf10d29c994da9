//! # Health State Module
//!
//! Rolling per-plugin health accounting: request counts, a bounded outcome
//! window, moving-average response time, derived error rate, threshold
//! classification, and a small trend analysis over recent response times.
//!
//! The containing monitor feeds two streams into the same windows: every
//! host-originated request outcome, and the periodic liveness probe. Status
//! classification follows a fixed precedence — resource or error-rate
//! ceilings mean `unhealthy`, a slow plugin or anything above 80% of its
//! ceiling means `degraded`, everything else is `healthy`. Plugins that do
//! not expose the extended metrics endpoint are classified from error rate
//! and response time alone.

use crate::wire::ResourceMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Outcomes kept in the classification window.
pub const OUTCOME_WINDOW: usize = 20;
/// Response-time samples kept for trend analysis.
pub const TREND_HISTORY: usize = 100;
/// Minimum samples before a trend is derived.
const TREND_MIN_SAMPLES: usize = 5;
/// Samples considered by one trend comparison.
const TREND_SPAN: usize = 10;

/// Health classification label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Direction of the recent response-time drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
    InsufficientData,
}

/// Ceilings used by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f64,
    /// Percentage, 0..100
    pub max_error_rate: f64,
    #[serde(with = "crate::duration_serde")]
    pub max_response_time: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_memory_bytes: 1024 * 1024 * 1024,
            max_cpu_percent: 80.0,
            max_error_rate: 10.0,
            max_response_time: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    duration_ms: f64,
}

/// Mutable per-plugin health record. Owned by the monitor; callers only
/// ever see [`HealthSnapshot`] copies.
#[derive(Debug)]
pub struct HealthState {
    status: HealthStatus,
    started_at: DateTime<Utc>,
    last_probe_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
    window: VecDeque<Sample>,
    history: VecDeque<f64>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    blocked_requests: u64,
    resources: Option<ResourceMetrics>,
    trend: Trend,
    trend_confidence: f64,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            started_at: Utc::now(),
            last_probe_at: None,
            last_activity_at: None,
            consecutive_failures: 0,
            last_error: None,
            window: VecDeque::with_capacity(OUTCOME_WINDOW),
            history: VecDeque::with_capacity(TREND_HISTORY),
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            blocked_requests: 0,
            resources: None,
            trend: Trend::InsufficientData,
            trend_confidence: 0.0,
        }
    }

    /// Record one request outcome.
    pub fn record_request(
        &mut self,
        success: bool,
        duration: Duration,
        error: Option<&str>,
        thresholds: &HealthThresholds,
    ) {
        self.total_requests += 1;
        if success {
            self.total_successes += 1;
        } else {
            self.total_failures += 1;
        }
        self.last_activity_at = Some(Utc::now());
        self.push_sample(success, duration, error);
        self.reclassify(thresholds);
    }

    /// Record one probe outcome. Probes share the windows but also stamp
    /// the probe clock; they are a liveness floor, not request traffic, so
    /// the totals are untouched.
    pub fn record_probe(
        &mut self,
        success: bool,
        duration: Duration,
        error: Option<&str>,
        thresholds: &HealthThresholds,
    ) {
        self.last_probe_at = Some(Utc::now());
        self.push_sample(success, duration, error);
        self.reclassify(thresholds);
    }

    /// Count a call the breaker refused. Excluded from the failure windows
    /// by contract; kept so `total = success + failure` stays checkable.
    pub fn record_blocked(&mut self) {
        self.blocked_requests += 1;
    }

    /// Fold in extended resource metrics from the optional endpoint.
    pub fn record_resources(&mut self, metrics: ResourceMetrics, thresholds: &HealthThresholds) {
        self.resources = Some(metrics);
        self.reclassify(thresholds);
    }

    fn push_sample(&mut self, success: bool, duration: Duration, error: Option<&str>) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.last_error = error.map(|e| e.to_string());
        }

        self.window.push_back(Sample {
            success,
            duration_ms: duration.as_secs_f64() * 1000.0,
        });
        while self.window.len() > OUTCOME_WINDOW {
            self.window.pop_front();
        }

        self.history.push_back(duration.as_secs_f64() * 1000.0);
        while self.history.len() > TREND_HISTORY {
            self.history.pop_front();
        }
        self.recompute_trend();
    }

    /// Windowed error rate as a percentage.
    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.success).count();
        failures as f64 / self.window.len() as f64 * 100.0
    }

    /// Moving-average response time over the window, in milliseconds.
    pub fn avg_response_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|s| s.duration_ms).sum::<f64>() / self.window.len() as f64
    }

    fn reclassify(&mut self, thresholds: &HealthThresholds) {
        let error_rate = self.error_rate();
        let avg_ms = self.avg_response_ms();
        let max_ms = thresholds.max_response_time.as_secs_f64() * 1000.0;

        let (memory, cpu) = match self.resources {
            Some(r) => (r.memory_bytes as f64, r.cpu_percent),
            None => (0.0, 0.0),
        };
        let max_memory = thresholds.max_memory_bytes as f64;

        self.status = if memory > max_memory
            || cpu > thresholds.max_cpu_percent
            || error_rate > thresholds.max_error_rate
        {
            HealthStatus::Unhealthy
        } else if avg_ms > max_ms * 0.8
            || memory > max_memory * 0.8
            || cpu > thresholds.max_cpu_percent * 0.8
            || error_rate > thresholds.max_error_rate * 0.8
        {
            // The response-time ceiling folds into the 80% band check.
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
    }

    /// Compare the halves of the most recent samples.
    fn recompute_trend(&mut self) {
        if self.history.len() < TREND_MIN_SAMPLES {
            self.trend = Trend::InsufficientData;
            self.trend_confidence = 0.0;
            return;
        }
        let span = self.history.len().min(TREND_SPAN);
        let recent: Vec<f64> = self.history.iter().rev().take(span).rev().copied().collect();
        let mid = recent.len() / 2;
        let first = &recent[..mid];
        let second = &recent[mid..];
        let first_avg = first.iter().sum::<f64>() / first.len() as f64;
        let second_avg = second.iter().sum::<f64>() / second.len() as f64;

        if first_avg <= f64::EPSILON {
            self.trend = Trend::Stable;
            self.trend_confidence = 0.9;
            return;
        }

        if second_avg <= first_avg * 0.9 {
            self.trend = Trend::Improving;
            self.trend_confidence = 0.8;
        } else if second_avg >= first_avg * 1.1 {
            self.trend = Trend::Degrading;
            self.trend_confidence = 0.8;
        } else {
            self.trend = Trend::Stable;
            self.trend_confidence = 0.9;
        }
    }

    /// Copy-on-read view of this record.
    pub fn snapshot(&self, plugin_id: &str) -> HealthSnapshot {
        HealthSnapshot {
            plugin_id: plugin_id.to_string(),
            status: self.status,
            started_at: self.started_at,
            last_probe_at: self.last_probe_at,
            last_activity_at: self.last_activity_at,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            blocked_requests: self.blocked_requests,
            error_rate: self.error_rate(),
            avg_response_ms: self.avg_response_ms(),
            resources: self.resources,
            trend: self.trend,
            trend_confidence: self.trend_confidence,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable copy of one plugin's health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub plugin_id: String,
    pub status: HealthStatus,
    pub started_at: DateTime<Utc>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub blocked_requests: u64,
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub resources: Option<ResourceMetrics>,
    pub trend: Trend,
    pub trend_confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds::default()
    }

    fn record_n(state: &mut HealthState, n: usize, success: bool, ms: u64) {
        for _ in 0..n {
            state.record_request(
                success,
                Duration::from_millis(ms),
                (!success).then_some("injected failure"),
                &thresholds(),
            );
        }
    }

    #[test]
    fn fresh_state_is_unknown() {
        let state = HealthState::new();
        assert_eq!(state.status(), HealthStatus::Unknown);
    }

    #[test]
    fn fast_successes_classify_healthy() {
        let mut state = HealthState::new();
        record_n(&mut state, 10, true, 40);
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert_eq!(state.error_rate(), 0.0);
    }

    #[test]
    fn error_rate_over_the_ceiling_is_unhealthy() {
        let mut state = HealthState::new();
        record_n(&mut state, 8, true, 40);
        record_n(&mut state, 2, false, 40);
        // 2 of 10 = 20% > the 10% ceiling.
        assert_eq!(state.status(), HealthStatus::Unhealthy);
        assert_eq!(state.snapshot("p").consecutive_failures, 2);
    }

    #[test]
    fn error_rate_in_the_eighty_percent_band_is_degraded() {
        let mut state = HealthState::new();
        record_n(&mut state, 11, true, 40);
        record_n(&mut state, 1, false, 40);
        // 1 of 12 ≈ 8.3%: above 80% of the 10% ceiling, below the ceiling.
        assert_eq!(state.status(), HealthStatus::Degraded);
    }

    #[test]
    fn slow_responses_are_degraded() {
        let mut state = HealthState::new();
        record_n(&mut state, 10, true, 6000);
        assert_eq!(state.status(), HealthStatus::Degraded);
    }

    #[test]
    fn resource_ceilings_classify_unhealthy() {
        let mut state = HealthState::new();
        record_n(&mut state, 10, true, 40);
        state.record_resources(
            ResourceMetrics {
                memory_bytes: 2 * 1024 * 1024 * 1024,
                cpu_percent: 5.0,
            },
            &thresholds(),
        );
        assert_eq!(state.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn trend_needs_five_samples() {
        let mut state = HealthState::new();
        record_n(&mut state, 4, true, 100);
        assert_eq!(state.snapshot("p").trend, Trend::InsufficientData);
        record_n(&mut state, 1, true, 100);
        assert_ne!(state.snapshot("p").trend, Trend::InsufficientData);
    }

    #[test]
    fn improving_and_degrading_trends_are_detected() {
        let mut state = HealthState::new();
        record_n(&mut state, 5, true, 200);
        record_n(&mut state, 5, true, 100);
        let snap = state.snapshot("p");
        assert_eq!(snap.trend, Trend::Improving);
        assert!((snap.trend_confidence - 0.8).abs() < f64::EPSILON);

        let mut state = HealthState::new();
        record_n(&mut state, 5, true, 100);
        record_n(&mut state, 5, true, 200);
        assert_eq!(state.snapshot("p").trend, Trend::Degrading);

        let mut state = HealthState::new();
        record_n(&mut state, 10, true, 100);
        let snap = state.snapshot("p");
        assert_eq!(snap.trend, Trend::Stable);
        assert!((snap.trend_confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn windows_are_bounded() {
        let mut state = HealthState::new();
        record_n(&mut state, 300, true, 10);
        assert_eq!(state.window.len(), OUTCOME_WINDOW);
        assert_eq!(state.history.len(), TREND_HISTORY);
        assert_eq!(state.snapshot("p").total_requests, 300);
    }

    #[test]
    fn blocked_calls_do_not_move_the_failure_windows() {
        let mut state = HealthState::new();
        record_n(&mut state, 10, true, 10);
        for _ in 0..5 {
            state.record_blocked();
        }
        let snap = state.snapshot("p");
        assert_eq!(snap.blocked_requests, 5);
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.total_requests, snap.total_successes + snap.total_failures);
    }

    #[test]
    fn probes_share_the_windows_but_not_the_totals() {
        let mut state = HealthState::new();
        state.record_probe(false, Duration::from_millis(5), Some("down"), &thresholds());
        let snap = state.snapshot("p");
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.consecutive_failures, 1);
        assert!(snap.last_probe_at.is_some());
        assert_eq!(snap.last_error.as_deref(), Some("down"));
    }
}
