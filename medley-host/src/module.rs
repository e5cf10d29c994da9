//! # Module Facade
//!
//! [`PluginModule`] is the single entry point the host embeds: discovery,
//! enable/disable, load/unload, guarded requests with cached fallbacks,
//! notification fan-out, health snapshots, and hot-reload triggers all go
//! through it. Internally it wires the registry, the supervisors, the
//! health monitor, the fallback store, and the reload controller together
//! and owns every long-lived task through one cancellation root.
//!
//! ## Request path
//!
//! `request` consults the breaker first. A refused call is surfaced as
//! `CircuitOpen` after the fallback store had its chance; an allowed call
//! is timed, recorded, cached on success when the operation is declared
//! cacheable, and answered from the fallback store when it fails. Callers
//! always learn whether a value came from cache and with what confidence.
//!
//! ## Ordering guarantees
//!
//! Per plugin id, lifecycle operations are serialized on one lock — two
//! loads cannot overlap, and a reload cannot interleave with an unload.
//! Across plugins there is no global ordering.

use crate::config::RuntimeConfig;
use crate::discovery;
use crate::events::{EventBus, LifecycleEvent, LifecycleEventKind};
use crate::health_monitor::HealthMonitor;
use crate::hot_reload::{self, HotReloadController, HotReloadStatus};
use crate::registry::{DesiredState, PluginRegistry, PluginSnapshot, UpsertOutcome};
use crate::state_store::{JsonFileStore, NullStateStore, PersistedPlugin, StateStore};
use dashmap::DashMap;
use medley_plugin_sdk::client::PluginClient;
use medley_plugin_sdk::error::RuntimeError;
use medley_plugin_sdk::fallback::{
    FallbackRequest, FallbackStats, FallbackStore, FallbackStrategy,
};
use medley_plugin_sdk::health::HealthSnapshot;
use medley_plugin_sdk::manifest::PluginManifest;
use medley_plugin_sdk::supervisor::{RuntimeState, SpawnSpec, Supervisor};
use medley_plugin_sdk::wire::{FileScanned, ScanCompleted, ScanStarted, ServiceContext};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Answer from the guarded request path.
#[derive(Debug, Clone)]
pub struct PluginResponse {
    pub value: Value,
    pub from_cache: bool,
    pub strategy: FallbackStrategy,
    pub confidence: f64,
}

impl PluginResponse {
    fn live(value: Value) -> Self {
        Self {
            value,
            from_cache: false,
            strategy: FallbackStrategy::None,
            confidence: 1.0,
        }
    }
}

/// The plugin runtime: registry, supervisors, monitor, fallbacks, reload.
pub struct PluginModule {
    config: RuntimeConfig,
    registry: Arc<PluginRegistry>,
    monitor: Arc<HealthMonitor>,
    fallback: Arc<FallbackStore>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    supervisors: Arc<DashMap<String, Arc<Supervisor>>>,
    lifecycle_locks: DashMap<String, Arc<Mutex<()>>>,
    reload: std::sync::Mutex<Option<Arc<HotReloadController>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PluginModule {
    /// Build a module with the store implied by the configuration.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let store: Arc<dyn StateStore> = match &config.plugins.state_file {
            Some(path) => Arc::new(JsonFileStore::new(path.clone())),
            None => Arc::new(NullStateStore),
        };
        Self::with_state_store(config, store)
    }

    /// Build a module around an embedder-provided persistence sink.
    pub fn with_state_store(config: RuntimeConfig, store: Arc<dyn StateStore>) -> Arc<Self> {
        let monitor = Arc::new(HealthMonitor::new(
            config.health.clone(),
            config.breaker.clone(),
        ));
        let fallback = Arc::new(FallbackStore::new(config.fallback.clone()));
        Arc::new(Self {
            config,
            registry: Arc::new(PluginRegistry::new()),
            monitor,
            fallback,
            store,
            events: EventBus::default(),
            supervisors: Arc::new(DashMap::new()),
            lifecycle_locks: DashMap::new(),
            reload: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Discover plugins, restore persisted state, and start the background
    /// machinery (probe loop, fallback sweeper, hot-reload controller).
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let persisted: HashMap<String, PersistedPlugin> = self
            .store
            .load_all()
            .await
            .unwrap_or_else(|e| {
                tracing::error!("loading persisted plugin state: {e}");
                Vec::new()
            })
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        self.refresh_inner(&persisted).await?;

        // Probe loop.
        {
            let monitor = self.monitor.clone();
            let supervisors = self.supervisors.clone();
            let cancel = self.cancel.child_token();
            let _ = self.tracker.spawn(async move {
                monitor.run_probe_loop(supervisors, cancel).await;
            });
        }

        // Fallback sweeper.
        {
            let fallback = self.fallback.clone();
            let cancel = self.cancel.child_token();
            let _ = self.tracker.spawn(async move {
                let mut ticker = tokio::time::interval(fallback.sweep_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    fallback.sweep();
                }
            });
        }

        // Hot-reload controller; constructed even when watching is off so
        // manual triggers share one code path.
        let controller = HotReloadController::new(
            Arc::downgrade(self),
            self.config.hot_reload.clone(),
            self.cancel.child_token(),
        );
        if self.config.hot_reload.enabled {
            controller.start().await?;
        }
        *self.reload.lock().unwrap() = Some(controller);

        // Bring up everything the policy wants running.
        for snapshot in self.registry.list().await {
            if snapshot.desired == DesiredState::Enabled {
                if let Err(e) = self.load(&snapshot.record.id).await {
                    tracing::error!(
                        plugin = %snapshot.record.id,
                        "startup load failed: {e}"
                    );
                }
            }
        }

        tracing::info!(
            plugins = self.registry.list().await.len(),
            "plugin runtime started"
        );
        Ok(())
    }

    /// Stop everything: plugins, watchers, loops. Drains owned tasks with a
    /// bounded grace.
    pub async fn shutdown(&self) {
        tracing::info!("plugin runtime shutting down");
        if let Some(controller) = self.reload.lock().unwrap().take() {
            controller.stop().await;
        }

        // Plugins first, while their state watchers are still alive.
        let supervisors: Vec<(String, Arc<Supervisor>)> = self
            .supervisors
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let stops = supervisors.iter().map(|(_, s)| s.unload());
        for outcome in futures::future::join_all(stops).await {
            if let Err(e) = outcome {
                tracing::warn!("unload during shutdown: {e}");
            }
        }
        for (id, _) in &supervisors {
            self.registry.set_runtime(id, RuntimeState::Stopped).await;
        }

        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(Duration::from_secs(10), self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("shutdown grace elapsed with tasks still draining");
        }
    }

    // Registry surface -----------------------------------------------------

    /// All known plugins, by copy.
    pub async fn list(&self) -> Vec<PluginSnapshot> {
        self.registry.list().await
    }

    pub async fn get(&self, id: &str) -> Result<PluginSnapshot, RuntimeError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| RuntimeError::NotFound { plugin: id.into() })
    }

    /// Rescan the plugins directory, upserting records and tombstoning the
    /// vanished. Removal of a tombstoned record waits for its stop.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        self.refresh_inner(&HashMap::new()).await
    }

    async fn refresh_inner(
        &self,
        persisted: &HashMap<String, PersistedPlugin>,
    ) -> anyhow::Result<()> {
        let discovered = discovery::scan(&self.config.plugins.dir).await?;
        let mut seen: Vec<String> = Vec::with_capacity(discovered.len());

        for candidate in discovered {
            let id = candidate.record.id.clone();
            seen.push(id.clone());
            let outcome = self.registry.upsert(candidate.record.clone()).await;
            if outcome == UpsertOutcome::Inserted {
                let desired = match persisted.get(&id) {
                    Some(prior) => prior.desired,
                    None if candidate.record.auto_enabled(&self.config.auto_enable) => {
                        DesiredState::Enabled
                    }
                    None => DesiredState::Discovered,
                };
                self.registry.set_desired(&id, desired).await;
                self.events.emit(&id, LifecycleEventKind::Discovered);
                if desired == DesiredState::Enabled {
                    self.events.emit(&id, LifecycleEventKind::Enabled);
                }
            }
            self.persist_desired(&id).await;
        }

        for snapshot in self.registry.list().await {
            if !seen.contains(&snapshot.record.id) && !snapshot.tombstoned {
                tracing::info!(
                    plugin = %snapshot.record.id,
                    "plugin directory vanished, tombstoning"
                );
                self.registry.mark_tombstoned(&snapshot.record.id).await;
            }
        }
        self.reap().await;
        Ok(())
    }

    // Desired-state surface ------------------------------------------------

    /// Mark a plugin enabled and bring it up.
    pub async fn enable(&self, id: &str) -> Result<(), RuntimeError> {
        self.get(id).await?;
        self.registry.set_desired(id, DesiredState::Enabled).await;
        self.persist_desired(id).await;
        self.events.emit(id, LifecycleEventKind::Enabled);
        self.load(id).await
    }

    /// Take a plugin down and mark it disabled.
    pub async fn disable(&self, id: &str) -> Result<(), RuntimeError> {
        self.get(id).await?;
        self.unload(id).await?;
        self.registry.set_desired(id, DesiredState::Disabled).await;
        self.persist_desired(id).await;
        self.events.emit(id, LifecycleEventKind::Disabled);
        Ok(())
    }

    // Lifecycle surface ----------------------------------------------------

    /// Load a plugin; serialized per plugin id.
    pub async fn load(&self, id: &str) -> Result<(), RuntimeError> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.load_locked(id, true).await
    }

    /// Unload a plugin; serialized per plugin id, idempotent.
    pub async fn unload(&self, id: &str) -> Result<(), RuntimeError> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.unload_locked(id).await
    }

    pub(crate) async fn load_locked(
        &self,
        id: &str,
        mark_error_on_failure: bool,
    ) -> Result<(), RuntimeError> {
        let snapshot = self.get(id).await?;
        if snapshot.tombstoned {
            return Err(RuntimeError::NotFound { plugin: id.into() });
        }

        // A missing executable never registers health monitoring and never
        // counts against the breaker.
        if tokio::fs::metadata(&snapshot.record.binary_path).await.is_err() {
            if mark_error_on_failure {
                self.registry.set_desired(id, DesiredState::Error).await;
                self.persist_desired(id).await;
            }
            return Err(RuntimeError::BinaryMissing {
                path: snapshot.record.binary_path.clone(),
            });
        }

        let supervisor = self.supervisor_for(id);
        let plugin_dir = snapshot.record.plugin_dir().to_path_buf();
        let spec = SpawnSpec {
            binary_path: snapshot.record.binary_path.clone(),
            base_dir: plugin_dir.clone(),
            context: ServiceContext {
                plugin_id: id.to_string(),
                storage_url: self.config.host.storage_url.clone(),
                host_addr: self.config.host.service_addr.clone(),
                log_level: self.config.host.plugin_log_level.clone(),
                base_dir: plugin_dir.display().to_string(),
            },
        };

        self.registry.set_runtime(id, RuntimeState::Loading).await;
        let started = Instant::now();
        match supervisor.load(&spec).await {
            Ok(client) => {
                self.registry.set_runtime(id, RuntimeState::Running).await;
                self.monitor.register(id);
                if snapshot.desired == DesiredState::Error {
                    // A successful explicit load clears a prior error.
                    self.registry.set_desired(id, DesiredState::Enabled).await;
                    self.persist_desired(id).await;
                }
                self.apply_startup_config(id, &snapshot, &client).await;
                self.events.emit(id, LifecycleEventKind::Loaded);
                Ok(())
            }
            Err(e) => {
                self.registry.set_runtime(id, RuntimeState::Stopped).await;
                if e.counts_as_failure() {
                    self.monitor
                        .record_request(id, false, started.elapsed(), Some(&e))
                        .await;
                }
                if mark_error_on_failure {
                    self.registry.set_desired(id, DesiredState::Error).await;
                    self.persist_desired(id).await;
                }
                self.events.emit(
                    id,
                    LifecycleEventKind::LoadFailed {
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Push the active (or manifest-default) configuration to a fresh
    /// instance. Absence of the endpoint is fine.
    async fn apply_startup_config(
        &self,
        id: &str,
        snapshot: &PluginSnapshot,
        client: &Arc<PluginClient>,
    ) {
        let config = match &snapshot.active_config {
            Some(config) => config.clone(),
            None => match PluginManifest::load(snapshot.record.plugin_dir()) {
                Ok(manifest) => manifest.default_settings(),
                Err(_) => return,
            },
        };
        if config.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return;
        }
        match client.apply_config(&config).await {
            Ok(()) => {
                self.registry.set_active_config(id, Some(config)).await;
            }
            Err(RuntimeError::NotImplemented { .. }) => {}
            Err(e) => {
                tracing::warn!(plugin = %id, "startup config rejected: {e}");
            }
        }
    }

    pub(crate) async fn unload_locked(&self, id: &str) -> Result<(), RuntimeError> {
        self.get(id).await?;
        let Some(supervisor) = self.supervisors.get(id).map(|s| s.value().clone()) else {
            self.registry.set_runtime(id, RuntimeState::Stopped).await;
            return Ok(());
        };

        self.registry.set_runtime(id, RuntimeState::Stopping).await;
        supervisor.unload().await?;
        self.registry.set_runtime(id, RuntimeState::Stopped).await;
        self.monitor.unregister(id);
        self.events.emit(id, LifecycleEventKind::Stopped);
        self.reap().await;
        Ok(())
    }

    // Request surface ------------------------------------------------------

    /// Invoke a domain operation with breaker gating and cached fallback.
    pub async fn request(
        &self,
        id: &str,
        operation: &str,
        params: Value,
        cacheable: bool,
    ) -> Result<PluginResponse, RuntimeError> {
        self.get(id).await?;

        if !self.monitor.allow(id).await {
            self.monitor.record_blocked(id);
            let refusal = RuntimeError::CircuitOpen;
            let fallback_request = FallbackRequest::new(id, operation, params, &refusal);
            if let Some(hit) = self.fallback.lookup(&fallback_request) {
                return Ok(PluginResponse {
                    value: hit.value,
                    from_cache: true,
                    strategy: hit.strategy,
                    confidence: hit.confidence,
                });
            }
            return Err(refusal);
        }

        let Some(client) = self.client_for(id).await else {
            // Nothing to call; no outcome is recorded for the breaker.
            let error = RuntimeError::PluginCrashed { plugin: id.into() };
            let fallback_request = FallbackRequest::new(id, operation, params, &error);
            if let Some(hit) = self.fallback.lookup(&fallback_request) {
                return Ok(PluginResponse {
                    value: hit.value,
                    from_cache: true,
                    strategy: hit.strategy,
                    confidence: hit.confidence,
                });
            }
            return Err(error);
        };

        let started = Instant::now();
        let outcome = client
            .request_with_timeout(operation, params.clone(), self.monitor.request_timeout())
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                self.monitor.record_request(id, true, elapsed, None).await;
                if cacheable {
                    self.fallback.store(id, operation, &params, value.clone());
                }
                Ok(PluginResponse::live(value))
            }
            Err(e @ RuntimeError::NotImplemented { .. }) => {
                // Absent optional endpoint: not a failure, not fallback
                // material.
                Err(e)
            }
            Err(e) => {
                self.monitor
                    .record_request(id, false, elapsed, Some(&e))
                    .await;
                let fallback_request = FallbackRequest::new(id, operation, params, &e);
                if let Some(hit) = self.fallback.lookup(&fallback_request) {
                    return Ok(PluginResponse {
                        value: hit.value,
                        from_cache: true,
                        strategy: hit.strategy,
                        confidence: hit.confidence,
                    });
                }
                Err(e)
            }
        }
    }

    /// Validate and deliver a configuration object.
    pub async fn apply_config(&self, id: &str, config: Value) -> Result<(), RuntimeError> {
        let snapshot = self.get(id).await?;
        let manifest = PluginManifest::load(snapshot.record.plugin_dir())?;
        manifest.validate_settings(&config)?;

        if let Some(client) = self.client_for(id).await {
            match client.apply_config(&config).await {
                Ok(()) | Err(RuntimeError::NotImplemented { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.registry.set_active_config(id, Some(config)).await;
        Ok(())
    }

    // Notification surface -------------------------------------------------

    /// Fan a scanned-file event out to every running plugin.
    pub async fn notify_file_scanned(&self, event: FileScanned) {
        self.fan_out("on_media_file_scanned", move |client| {
            let event = event.clone();
            async move { client.on_media_file_scanned(&event).await }
        })
        .await;
    }

    /// Fan a scan-started event out to every running plugin.
    pub async fn notify_scan_started(&self, event: ScanStarted) {
        self.fan_out("on_scan_started", move |client| {
            let event = event.clone();
            async move { client.on_scan_started(&event).await }
        })
        .await;
    }

    /// Fan a scan-completed event out to every running plugin.
    pub async fn notify_scan_completed(&self, event: ScanCompleted) {
        self.fan_out("on_scan_completed", move |client| {
            let event = event.clone();
            async move { client.on_scan_completed(&event).await }
        })
        .await;
    }

    /// One task per running target; failures are recorded and logged but
    /// never reach the caller, and one slow plugin never delays another.
    async fn fan_out<F, Fut>(&self, hook: &'static str, call: F)
    where
        F: Fn(Arc<PluginClient>) -> Fut,
        Fut: std::future::Future<Output = Result<(), RuntimeError>> + Send + 'static,
    {
        let targets: Vec<(String, Arc<Supervisor>)> = self
            .supervisors
            .iter()
            .filter(|e| e.value().runtime_state() == RuntimeState::Running)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (plugin_id, supervisor) in targets {
            let Some(client) = supervisor.client().await else {
                continue;
            };
            let future = call(client);
            let monitor = self.monitor.clone();
            let _ = self.tracker.spawn(async move {
                let started = Instant::now();
                match future.await {
                    Ok(()) => {
                        monitor
                            .record_request(&plugin_id, true, started.elapsed(), None)
                            .await;
                    }
                    Err(RuntimeError::NotImplemented { .. }) => {
                        tracing::trace!(plugin = %plugin_id, "{hook} not implemented");
                    }
                    Err(e) => {
                        tracing::warn!(plugin = %plugin_id, "{hook} failed: {e}");
                        monitor
                            .record_request(&plugin_id, false, started.elapsed(), Some(&e))
                            .await;
                    }
                }
            });
        }
    }

    // Health and breaker surface -------------------------------------------

    /// Health snapshot for one plugin.
    pub async fn health(&self, id: &str) -> Result<HealthSnapshot, RuntimeError> {
        self.get(id).await?;
        self.monitor
            .snapshot(id)
            .ok_or_else(|| RuntimeError::NotFound { plugin: id.into() })
    }

    /// Health snapshots for every monitored plugin.
    pub fn health_all(&self) -> Vec<HealthSnapshot> {
        self.monitor.snapshots()
    }

    /// Breaker counters for every plugin.
    pub async fn breaker_metrics(
        &self,
    ) -> Vec<medley_plugin_sdk::circuit_breaker::CircuitBreakerMetrics> {
        self.monitor.breaker_metrics().await
    }

    /// Zero a plugin's windows and close its breaker.
    pub async fn reset_breaker(&self, id: &str) -> Result<(), RuntimeError> {
        self.get(id).await?;
        self.monitor.reset(id).await;
        Ok(())
    }

    /// Fallback store counters.
    pub fn fallback_stats(&self) -> FallbackStats {
        self.fallback.stats()
    }

    /// Peek at the cached answer for a request without touching the
    /// plugin. `CacheMiss` when nothing usable is stored.
    pub async fn cached_response(
        &self,
        id: &str,
        operation: &str,
        params: Value,
    ) -> Result<PluginResponse, RuntimeError> {
        self.get(id).await?;
        let probe = FallbackRequest::new(id, operation, params, &RuntimeError::CacheMiss);
        match self.fallback.lookup(&probe) {
            Some(hit) => Ok(PluginResponse {
                value: hit.value,
                from_cache: true,
                strategy: hit.strategy,
                confidence: hit.confidence,
            }),
            None => Err(RuntimeError::CacheMiss),
        }
    }

    // Hot-reload surface ---------------------------------------------------

    /// Reload one plugin now, with the configured retry policy.
    pub async fn trigger_reload(self: &Arc<Self>, id: &str) -> Result<(), RuntimeError> {
        let controller = self.reload.lock().unwrap().clone();
        match controller {
            Some(controller) => controller.trigger(id).await,
            None => {
                let cancel = self.cancel.child_token();
                hot_reload::reload_with_retries(self, id, &self.config.hot_reload, &cancel).await
            }
        }
    }

    /// Watcher status for the admin surface.
    pub fn hot_reload_status(&self) -> HotReloadStatus {
        match self.reload.lock().unwrap().as_ref() {
            Some(controller) => controller.status(),
            None => HotReloadStatus {
                enabled: false,
                watched_plugins: 0,
                pending_reloads: 0,
            },
        }
    }

    /// Toggle the watcher at runtime.
    pub async fn set_hot_reload_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        let controller = self.reload.lock().unwrap().clone();
        let Some(controller) = controller else {
            anyhow::bail!("hot reload controller is not initialized");
        };
        if enabled {
            controller.start().await
        } else {
            controller.stop().await;
            Ok(())
        }
    }

    // Events ---------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    // Internals ------------------------------------------------------------

    /// Spawn a background task owned by the module's shutdown drain.
    pub(crate) fn spawn_tracked<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let _ = self.tracker.spawn(future);
    }

    /// As [`Self::spawn_tracked`], returning the handle for abortion.
    pub(crate) fn spawn_tracked_handle<F>(&self, future: F) -> tokio::task::JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future)
    }

    pub(crate) fn lifecycle_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.lifecycle_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(crate) fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub(crate) fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) async fn client_for(&self, id: &str) -> Option<Arc<PluginClient>> {
        // Clone the supervisor out before awaiting; map guards must not be
        // held across suspension points.
        let supervisor = self.supervisors.get(id).map(|s| s.value().clone())?;
        supervisor.client().await
    }

    /// Get or create the supervisor for a plugin, wiring its state watch
    /// into the registry and event bus on first creation.
    fn supervisor_for(&self, id: &str) -> Arc<Supervisor> {
        if let Some(existing) = self.supervisors.get(id) {
            return existing.clone();
        }
        let supervisor = Arc::new(Supervisor::new(id, self.config.supervisor.clone()));
        self.supervisors
            .insert(id.to_string(), supervisor.clone());

        let mut watch = supervisor.state_watch();
        let registry = self.registry.clone();
        let monitor = self.monitor.clone();
        let events = self.events.clone();
        let cancel = self.cancel.child_token();
        let plugin_id = id.to_string();
        let _ = self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = watch.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let state = *watch.borrow();
                registry.set_runtime(&plugin_id, state).await;
                if state == RuntimeState::Crashed {
                    // DesiredState is untouched; a reconciler or the reload
                    // controller may bring the plugin back.
                    tracing::error!(plugin = %plugin_id, "plugin crashed");
                    monitor.unregister(&plugin_id);
                    events.emit(&plugin_id, LifecycleEventKind::Crashed);
                }
            }
        });
        supervisor
    }

    async fn persist_desired(&self, id: &str) {
        let Some(snapshot) = self.registry.get(id).await else {
            return;
        };
        let persisted = PersistedPlugin {
            id: id.to_string(),
            desired: snapshot.desired,
            version: snapshot.record.version.clone(),
            installed_at: snapshot.record.installed_at,
        };
        if let Err(e) = self.store.put(persisted).await {
            tracing::error!(plugin = %id, "persisting plugin state: {e}");
        }
    }

    /// Remove tombstoned records that have reached a full stop.
    async fn reap(&self) {
        for id in self.registry.reap_tombstones().await {
            tracing::info!(plugin = %id, "removing tombstoned plugin");
            self.supervisors.remove(&id);
            self.lifecycle_locks.remove(&id);
            self.monitor.unregister(&id);
            self.fallback.invalidate_plugin(&id);
            if let Err(e) = self.store.remove(&id).await {
                tracing::error!(plugin = %id, "dropping persisted state: {e}");
            }
            self.events.emit(&id, LifecycleEventKind::Removed);
        }
    }

    /// Direct fallback-store access for the embedding host (e.g. to
    /// register synthetic defaults for critical operations).
    pub fn fallback_store(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }
}
