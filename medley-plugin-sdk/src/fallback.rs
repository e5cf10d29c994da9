//! # Fallback Store Module
//!
//! A bounded cache of last-known-good responses, consulted when a plugin
//! call fails or the circuit breaker refuses it. Entries are keyed by
//! `(plugin id, operation, request fingerprint)` so only an identical
//! request can be answered from cache; the caller decides whether cached
//! data is acceptable for its semantics.
//!
//! ## Confidence decay
//!
//! Every entry starts at confidence 1.0 and decays linearly with age:
//! `confidence = 1.0 − 0.75 · (age / ttl)`, clamped to `[0.25, 1.0]` while
//! the entry is alive. The schedule is monotone non-increasing; an entry at
//! its TTL is evicted rather than served (unless stale serving is enabled,
//! which answers with the `stale-acceptable` strategy at a fixed 0.1).
//!
//! ## Eviction
//!
//! Three mechanisms bound the store: per-entry TTL checked on read,
//! size-pressure LRU eviction on write, and a background sweep that removes
//! expired entries at a bounded rate per pass.

use crate::error::RuntimeError;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// How a fallback response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// A fresh cached response from a prior success
    LastGood,
    /// An expired entry served because stale data was allowed
    StaleAcceptable,
    /// A registered synthetic default for the operation
    DefaultSynthetic,
    /// No fallback was applied
    None,
}

/// Tuning for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Maximum number of cached entries before LRU eviction
    pub capacity: usize,
    /// Default entry lifetime
    #[serde(with = "crate::duration_serde")]
    pub default_ttl: Duration,
    /// Background sweep cadence
    #[serde(with = "crate::duration_serde")]
    pub sweep_interval: Duration,
    /// Upper bound on entries removed per sweep pass
    pub sweep_batch: usize,
    /// Serve expired entries (strategy `stale-acceptable`) instead of
    /// reporting a miss
    pub serve_stale: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            default_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_batch: 256,
            serve_stale: false,
        }
    }
}

/// Cache key: plugin, operation, and a fingerprint of the parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub plugin_id: String,
    pub operation: String,
    pub fingerprint: u64,
}

/// One cached response with its decay inputs.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    cached_at: SystemTime,
    ttl: Duration,
}

impl CacheEntry {
    fn age(&self) -> Duration {
        self.cached_at.elapsed().unwrap_or(Duration::MAX)
    }

    fn is_expired(&self) -> bool {
        self.age() > self.ttl
    }

    /// Linear decay from 1.0 to the 0.25 floor over the TTL.
    fn confidence(&self) -> f64 {
        let ratio = self.age().as_secs_f64() / self.ttl.as_secs_f64();
        (1.0 - 0.75 * ratio).clamp(0.25, 1.0)
    }
}

/// The request context at the moment of failure, as handed to the store.
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub plugin_id: String,
    pub operation: String,
    pub params: Value,
    pub original_error: String,
    pub requested_at: SystemTime,
}

impl FallbackRequest {
    pub fn new(
        plugin_id: impl Into<String>,
        operation: impl Into<String>,
        params: Value,
        original_error: &RuntimeError,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            operation: operation.into(),
            params,
            original_error: original_error.to_string(),
            requested_at: SystemTime::now(),
        }
    }
}

/// A fallback decision in the caller's favor.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackResponse {
    pub value: Value,
    pub from_cache: bool,
    pub strategy: FallbackStrategy,
    pub confidence: f64,
}

/// Hit/miss counters, surfaced by copy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub synthetic_hits: u64,
    pub stored: u64,
    pub swept: u64,
}

/// Bounded cache of last-known-good responses.
///
/// Readers and the single writer coordinate through one mutex; everything
/// returned to callers is a copy.
pub struct FallbackStore {
    config: FallbackConfig,
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    /// Synthetic per-operation defaults, consulted last
    defaults: Mutex<std::collections::HashMap<String, Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    synthetic_hits: AtomicU64,
    stored: AtomicU64,
    swept: AtomicU64,
}

impl FallbackStore {
    pub fn new(config: FallbackConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("capacity is non-zero");
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
            defaults: Mutex::new(std::collections::HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            synthetic_hits: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    /// Deterministic fingerprint of a parameter object.
    ///
    /// `serde_json` keeps object keys sorted, so two maps with the same
    /// contents render identically regardless of insertion order.
    pub fn fingerprint(params: &Value) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        params.to_string().hash(&mut hasher);
        hasher.finish()
    }

    fn key(plugin_id: &str, operation: &str, params: &Value) -> CacheKey {
        CacheKey {
            plugin_id: plugin_id.to_string(),
            operation: operation.to_string(),
            fingerprint: Self::fingerprint(params),
        }
    }

    /// Deposit a successful response with the default TTL.
    pub fn store(&self, plugin_id: &str, operation: &str, params: &Value, value: Value) {
        self.store_with_ttl(plugin_id, operation, params, value, self.config.default_ttl);
    }

    /// Deposit a successful response with a per-operation TTL.
    pub fn store_with_ttl(
        &self,
        plugin_id: &str,
        operation: &str,
        params: &Value,
        value: Value,
        ttl: Duration,
    ) {
        let key = Self::key(plugin_id, operation, params);
        let entry = CacheEntry {
            value,
            cached_at: SystemTime::now(),
            ttl,
        };
        let mut entries = self.entries.lock().unwrap();
        entries.put(key, entry);
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Look up a fallback for a failed or blocked request.
    ///
    /// Returns `None` on a genuine miss; the caller then propagates the
    /// original error.
    pub fn lookup(&self, request: &FallbackRequest) -> Option<FallbackResponse> {
        let key = Self::key(&request.plugin_id, &request.operation, &request.params);

        let cached = {
            let mut entries = self.entries.lock().unwrap();
            // The first match only clones out of the borrow; the expired
            // entry is popped after the borrow ends.
            let looked_up = match entries.get(&key) {
                Some(entry) if !entry.is_expired() => Some(Some((
                    entry.value.clone(),
                    FallbackStrategy::LastGood,
                    entry.confidence(),
                ))),
                Some(entry) if self.config.serve_stale => Some(Some((
                    entry.value.clone(),
                    FallbackStrategy::StaleAcceptable,
                    0.1,
                ))),
                Some(_) => Some(None),
                None => None,
            };
            match looked_up {
                Some(Some(hit)) => Some(hit),
                Some(None) => {
                    entries.pop(&key);
                    None
                }
                None => None,
            }
        };

        if let Some((value, strategy, confidence)) = cached {
            match strategy {
                FallbackStrategy::StaleAcceptable => {
                    self.stale_hits.fetch_add(1, Ordering::Relaxed)
                }
                _ => self.hits.fetch_add(1, Ordering::Relaxed),
            };
            tracing::debug!(
                plugin = %request.plugin_id,
                operation = %request.operation,
                ?strategy,
                "serving fallback for failed call ({})",
                request.original_error
            );
            return Some(FallbackResponse {
                value,
                from_cache: true,
                strategy,
                confidence,
            });
        }

        if let Some(default) = self.defaults.lock().unwrap().get(&request.operation) {
            self.synthetic_hits.fetch_add(1, Ordering::Relaxed);
            return Some(FallbackResponse {
                value: default.clone(),
                from_cache: true,
                strategy: FallbackStrategy::DefaultSynthetic,
                confidence: 0.05,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Register a synthetic default answer for an operation.
    pub fn register_default(&self, operation: impl Into<String>, value: Value) {
        self.defaults.lock().unwrap().insert(operation.into(), value);
    }

    /// Drop every entry belonging to one plugin (unload/reload hygiene).
    pub fn invalidate_plugin(&self, plugin_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(k, _)| k.plugin_id == plugin_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    /// Remove up to `sweep_batch` expired entries; returns the count.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .take(self.config.sweep_batch)
            .map(|(k, _)| k.clone())
            .collect();
        let removed = expired.len();
        for key in expired {
            entries.pop(&key);
        }
        if removed > 0 {
            self.swept.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!("fallback sweep removed {removed} expired entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            synthetic_hits: self.synthetic_hits.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> FallbackStore {
        FallbackStore::new(FallbackConfig::default())
    }

    fn request(plugin: &str, op: &str, params: Value) -> FallbackRequest {
        FallbackRequest {
            plugin_id: plugin.into(),
            operation: op.into(),
            params,
            original_error: "request timed out".into(),
            requested_at: SystemTime::now(),
        }
    }

    #[test]
    fn identical_requests_hit_the_cached_value() {
        let store = store();
        let params = json!({"path": "/media/a.mkv", "quality": "high"});
        store.store("t-transcoder", "probe_media", &params, json!({"codec": "h264"}));

        let hit = store
            .lookup(&request("t-transcoder", "probe_media", params.clone()))
            .unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.strategy, FallbackStrategy::LastGood);
        assert_eq!(hit.value["codec"], "h264");
        assert!(hit.confidence <= 1.0 && hit.confidence > 0.9);
    }

    #[test]
    fn different_params_are_different_keys() {
        let store = store();
        store.store("p", "op", &json!({"a": 1}), json!(1));
        assert!(store.lookup(&request("p", "op", json!({"a": 2}))).is_none());
        assert!(store.lookup(&request("p", "other", json!({"a": 1}))).is_none());
        assert!(store.lookup(&request("q", "op", json!({"a": 1}))).is_none());
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(FallbackStore::fingerprint(&a), FallbackStore::fingerprint(&b));
    }

    #[test]
    fn expired_entries_miss_and_are_dropped() {
        let store = store();
        store.store_with_ttl("p", "op", &json!({}), json!(1), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.lookup(&request("p", "op", json!({}))).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn stale_serving_answers_with_reduced_confidence() {
        let mut config = FallbackConfig::default();
        config.serve_stale = true;
        let store = FallbackStore::new(config);
        store.store_with_ttl("p", "op", &json!({}), json!("old"), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        let hit = store.lookup(&request("p", "op", json!({}))).unwrap();
        assert_eq!(hit.strategy, FallbackStrategy::StaleAcceptable);
        assert!((hit.confidence - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn synthetic_defaults_answer_when_nothing_is_cached() {
        let store = store();
        store.register_default("list_profiles", json!([]));
        let hit = store
            .lookup(&request("p", "list_profiles", json!({})))
            .unwrap();
        assert_eq!(hit.strategy, FallbackStrategy::DefaultSynthetic);
        assert_eq!(hit.value, json!([]));
    }

    #[test]
    fn capacity_pressure_evicts_least_recently_used() {
        let mut config = FallbackConfig::default();
        config.capacity = 2;
        let store = FallbackStore::new(config);
        store.store("p", "op", &json!({"n": 1}), json!(1));
        store.store("p", "op", &json!({"n": 2}), json!(2));
        // Touch entry 1 so entry 2 is the eviction candidate.
        assert!(store.lookup(&request("p", "op", json!({"n": 1}))).is_some());
        store.store("p", "op", &json!({"n": 3}), json!(3));

        assert!(store.lookup(&request("p", "op", json!({"n": 1}))).is_some());
        assert!(store.lookup(&request("p", "op", json!({"n": 2}))).is_none());
        assert!(store.lookup(&request("p", "op", json!({"n": 3}))).is_some());
    }

    #[test]
    fn sweep_removes_expired_at_a_bounded_rate() {
        let mut config = FallbackConfig::default();
        config.sweep_batch = 3;
        let store = FallbackStore::new(config);
        for n in 0..5 {
            store.store_with_ttl("p", "op", &json!({ "n": n }), json!(n), Duration::ZERO);
        }
        store.store("p", "op", &json!({"n": "alive"}), json!(true));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.sweep(), 3);
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn invalidate_plugin_only_touches_that_plugin() {
        let store = store();
        store.store("a", "op", &json!({}), json!(1));
        store.store("b", "op", &json!({}), json!(2));
        store.invalidate_plugin("a");
        assert!(store.lookup(&request("a", "op", json!({}))).is_none());
        assert!(store.lookup(&request("b", "op", json!({}))).is_some());
    }

    #[test]
    fn confidence_decays_monotonically() {
        let entry = CacheEntry {
            value: json!(1),
            cached_at: SystemTime::now() - Duration::from_secs(12 * 60 * 60),
            ttl: Duration::from_secs(24 * 60 * 60),
        };
        // Halfway through the TTL: 1.0 − 0.75 · 0.5 = 0.625.
        assert!((entry.confidence() - 0.625).abs() < 0.01);

        let fresh = CacheEntry {
            value: json!(1),
            cached_at: SystemTime::now(),
            ttl: Duration::from_secs(24 * 60 * 60),
        };
        assert!(fresh.confidence() > entry.confidence());
    }
}
