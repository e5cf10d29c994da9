//! # Hot-Reload Controller Module
//!
//! Watches plugin directories for binary swaps and restarts the affected
//! plugin in place, preserving whatever state the old instance can export.
//!
//! ## Event handling
//!
//! One recursive watcher covers the plugins root. Events are filtered hard:
//! the directory name must match an include glob, the file must be the
//! plugin's declared binary, and only write/create/chmod event kinds count.
//! Manifest edits, logs, temp files, and sources never trigger a reload.
//!
//! Matching events arm a per-plugin debounce timer; further events on the
//! same plugin reset it. A binary being copied in chunks therefore produces
//! exactly one reload, after the last chunk.
//!
//! ## Reload sequence
//!
//! snapshot (version, active config, optional exported blob, last
//! activity) → unload with the supervisor's grace → re-parse the manifest →
//! load → restore (import hook, or the configuration path when the hook is
//! absent) → success event carrying both versions. Any step failing emits a
//! failure event and retries with exponential backoff, leaving the desired
//! state untouched. One reload per plugin is in flight at a time; different
//! plugins reload in parallel.

use crate::config::HotReloadConfig;
use crate::events::LifecycleEventKind;
use crate::module::PluginModule;
use crate::registry::PluginSnapshot;
use dashmap::DashMap;
use medley_plugin_sdk::error::RuntimeError;
use medley_plugin_sdk::manifest::{PluginManifest, MANIFEST_FILE};
use medley_plugin_sdk::wire::StateSnapshot;
use notify::event::{EventKind, MetadataKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rand::Rng;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

/// Watcher state for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct HotReloadStatus {
    pub enabled: bool,
    pub watched_plugins: usize,
    pub pending_reloads: usize,
}

/// Debounced filesystem watcher plus reload orchestration.
pub struct HotReloadController {
    module: Weak<PluginModule>,
    config: HotReloadConfig,
    cancel: CancellationToken,
    enabled: AtomicBool,
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
    drain_cancel: std::sync::Mutex<Option<CancellationToken>>,
    pending: Arc<DashMap<String, tokio::task::JoinHandle<()>>>,
    watched_plugins: AtomicUsize,
}

impl HotReloadController {
    pub fn new(
        module: Weak<PluginModule>,
        config: HotReloadConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            module,
            config,
            cancel,
            enabled: AtomicBool::new(false),
            watcher: std::sync::Mutex::new(None),
            drain_cancel: std::sync::Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            watched_plugins: AtomicUsize::new(0),
        })
    }

    /// Install the watcher and start draining events. Idempotent.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(module) = self.module.upgrade() else {
            anyhow::bail!("plugin runtime is gone");
        };
        let root = module.config().plugins.dir.clone();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(
            move |outcome: Result<notify::Event, notify::Error>| match outcome {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => {
                    tracing::warn!("filesystem watcher error: {e}");
                }
            },
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        *self.watcher.lock().unwrap() = Some(watcher);

        self.watched_plugins
            .store(count_watched_dirs(&root, &self.config), Ordering::Relaxed);

        let drain_cancel = self.cancel.child_token();
        *self.drain_cancel.lock().unwrap() = Some(drain_cancel.clone());
        let controller = self.clone();
        module.spawn_tracked(async move {
            loop {
                tokio::select! {
                    _ = drain_cancel.cancelled() => return,
                    event = rx.recv() => {
                        match event {
                            Some(event) => controller.handle_event(event).await,
                            None => return,
                        }
                    }
                }
            }
        });

        tracing::info!(
            root = %root.display(),
            watched = self.watched_plugins.load(Ordering::Relaxed),
            "hot reload watching"
        );
        Ok(())
    }

    /// Remove the watcher and cancel every pending debounce timer.
    pub async fn stop(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.watcher.lock().unwrap() = None;
        if let Some(cancel) = self.drain_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let pending: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in pending {
            if let Some((_, handle)) = self.pending.remove(&id) {
                handle.abort();
            }
        }
        tracing::info!("hot reload stopped");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> HotReloadStatus {
        HotReloadStatus {
            enabled: self.is_enabled(),
            watched_plugins: self.watched_plugins.load(Ordering::Relaxed),
            pending_reloads: self.pending.len(),
        }
    }

    /// Manual reload with the configured retry policy.
    pub async fn trigger(self: &Arc<Self>, plugin_id: &str) -> Result<(), RuntimeError> {
        let Some(module) = self.module.upgrade() else {
            return Err(RuntimeError::NotFound {
                plugin: plugin_id.into(),
            });
        };
        reload_with_retries(&module, plugin_id, &self.config, &self.cancel).await
    }

    async fn handle_event(&self, event: notify::Event) {
        if !is_reload_event(&event.kind) {
            return;
        }
        let Some(module) = self.module.upgrade() else {
            return;
        };
        let root = module.config().plugins.dir.clone();

        for path in &event.paths {
            let Some((dir_name, file_name)) = split_plugin_path(&root, path) else {
                continue;
            };
            if !self.dir_is_watched(&dir_name) || is_excluded(&file_name, &self.config) {
                continue;
            }
            let Some(snapshot) = find_by_dir(&module, &dir_name).await else {
                continue;
            };
            let binary_name = snapshot
                .record
                .binary_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string());
            if binary_name.as_deref() != Some(file_name.as_str()) {
                continue;
            }
            tracing::debug!(
                plugin = %snapshot.record.id,
                file = %file_name,
                kind = ?event.kind,
                "binary change observed, debouncing"
            );
            self.schedule(snapshot.record.id);
        }
    }

    fn dir_is_watched(&self, dir_name: &str) -> bool {
        self.config
            .include_globs
            .iter()
            .any(|glob| matches_glob(dir_name, glob))
    }

    /// Arm (or re-arm) the per-plugin debounce timer.
    fn schedule(&self, plugin_id: String) {
        let Some(module) = self.module.upgrade() else {
            return;
        };
        let pending = self.pending.clone();
        let config = self.config.clone();
        let debounce = self.config.debounce;
        let cancel = self.cancel.clone();
        let id_for_task = plugin_id.clone();
        let module_for_task = module.clone();

        let handle = module.spawn_tracked_handle(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    pending.remove(&id_for_task);
                    return;
                }
                _ = tokio::time::sleep(debounce) => {}
            }
            pending.remove(&id_for_task);
            if let Err(e) =
                reload_with_retries(&module_for_task, &id_for_task, &config, &cancel).await
            {
                tracing::error!(plugin = %id_for_task, "hot reload failed: {e}");
            }
        });

        if let Some(previous) = self.pending.insert(plugin_id, handle) {
            previous.abort();
        }
    }
}

/// Run the reload sequence with exponential backoff between attempts.
///
/// Aborts between attempts when `cancel` fires (controller disable or
/// runtime shutdown); an attempt already in flight runs to completion so a
/// plugin is never abandoned mid-swap.
pub async fn reload_with_retries(
    module: &Arc<PluginModule>,
    plugin_id: &str,
    config: &HotReloadConfig,
    cancel: &CancellationToken,
) -> Result<(), RuntimeError> {
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Plugin {
                kind: "reload_cancelled".into(),
                message: format!("reload of {plugin_id} cancelled"),
            });
        }
        match reload_once(module, plugin_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                module.events().emit(
                    plugin_id,
                    LifecycleEventKind::ReloadFailed {
                        error: e.to_string(),
                    },
                );
                if attempt >= config.max_retries {
                    tracing::error!(
                        plugin = %plugin_id,
                        attempts = attempt,
                        "giving up on reload: {e}"
                    );
                    return Err(e);
                }
                let backoff = config.backoff_base * 2u32.pow(attempt - 1)
                    + std::time::Duration::from_millis(rand::thread_rng().gen_range(0..250u64));
                tracing::warn!(
                    plugin = %plugin_id,
                    attempt,
                    "reload failed ({e}), retrying in {backoff:?}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(e);
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// One staged swap: snapshot → stop → re-discover → start → restore.
///
/// Holds the plugin's lifecycle lock for the whole sequence so no other
/// lifecycle operation can interleave. The desired state is deliberately
/// left alone on failure.
async fn reload_once(module: &Arc<PluginModule>, plugin_id: &str) -> Result<(), RuntimeError> {
    let lock = module.lifecycle_lock(plugin_id);
    let _guard = lock.lock().await;

    let snapshot = module
        .registry()
        .get(plugin_id)
        .await
        .ok_or_else(|| RuntimeError::NotFound {
            plugin: plugin_id.into(),
        })?;
    if snapshot.tombstoned {
        return Err(RuntimeError::NotFound {
            plugin: plugin_id.into(),
        });
    }
    let old_version = snapshot.record.version.clone();
    let plugin_dir = snapshot.record.plugin_dir().to_path_buf();

    // Step 1: capture what the old instance can tell us.
    let active_config = match &snapshot.active_config {
        Some(config) => Some(config.clone()),
        None => PluginManifest::load(&plugin_dir).ok().and_then(|m| {
            let defaults = m.default_settings();
            defaults
                .as_object()
                .map(|o| !o.is_empty())
                .unwrap_or(false)
                .then_some(defaults)
        }),
    };
    let opaque = match module.client_for(plugin_id).await {
        Some(client) => client.export_state().await.ok(),
        None => None,
    };
    let state_snapshot = StateSnapshot {
        version: old_version.clone(),
        config: active_config.clone(),
        opaque,
        last_activity: module.monitor().last_activity(plugin_id),
    };

    // Step 2: stop the old instance within the supervisor's grace.
    module.unload_locked(plugin_id).await?;

    // Step 3: the binary or version may have changed on disk.
    let manifest = PluginManifest::load(&plugin_dir)?;
    let new_record = crate::registry::PluginRecord::from_manifest(&manifest, &plugin_dir);
    let new_version = new_record.version.clone();
    module.registry().upsert(new_record).await;

    // Step 4: start the new instance; desired state is not touched on
    // failure here.
    module.load_locked(plugin_id, false).await?;

    // Step 5: restore state, preferring the import hook.
    if let Some(client) = module.client_for(plugin_id).await {
        match client.import_state(&state_snapshot).await {
            Ok(()) => {}
            Err(RuntimeError::NotImplemented { .. }) => {
                if let Some(config) = &active_config {
                    match client.apply_config(config).await {
                        Ok(()) | Err(RuntimeError::NotImplemented { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
    module
        .registry()
        .set_active_config(plugin_id, active_config)
        .await;

    tracing::info!(
        plugin = %plugin_id,
        old_version = %old_version,
        new_version = %new_version,
        "hot reload complete"
    );
    module.events().emit(
        plugin_id,
        LifecycleEventKind::ReloadSucceeded {
            old_version,
            new_version,
        },
    );
    Ok(())
}

/// Write, create, and chmod count; renames, removals, and reads do not.
fn is_reload_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Data(_)) => true,
        EventKind::Modify(ModifyKind::Any) => true,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)) => true,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)) => true,
        _ => false,
    }
}

/// Split an event path into (plugin directory name, file name) relative to
/// the plugins root. Events outside the root or directly on it are ignored.
fn split_plugin_path(root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let dir = components.next()?.as_os_str().to_string_lossy().to_string();
    let file = path.file_name()?.to_string_lossy().to_string();
    if dir == file && components.clone().next().is_none() {
        // The event is on the plugin directory itself, not a file in it.
        return None;
    }
    Some((dir, file))
}

fn is_excluded(file_name: &str, config: &HotReloadConfig) -> bool {
    if file_name == MANIFEST_FILE || file_name.starts_with('.') {
        return true;
    }
    config
        .exclude_suffixes
        .iter()
        .any(|suffix| file_name.ends_with(suffix.as_str()))
}

async fn find_by_dir(module: &Arc<PluginModule>, dir_name: &str) -> Option<PluginSnapshot> {
    module
        .registry()
        .list()
        .await
        .into_iter()
        .find(|s| {
            s.record
                .plugin_dir()
                .file_name()
                .map(|n| n.to_string_lossy() == dir_name)
                .unwrap_or(false)
        })
}

/// Simple `*` wildcard match; the only metacharacter the include set uses.
fn matches_glob(name: &str, pattern: &str) -> bool {
    fn inner(name: &[u8], pattern: &[u8]) -> bool {
        match pattern.first() {
            None => name.is_empty(),
            Some(b'*') => {
                inner(name, &pattern[1..])
                    || (!name.is_empty() && inner(&name[1..], pattern))
            }
            Some(c) => name.first() == Some(c) && inner(&name[1..], &pattern[1..]),
        }
    }
    inner(name.as_bytes(), pattern.as_bytes())
}

fn count_watched_dirs(root: &Path, config: &HotReloadConfig) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            config
                .include_globs
                .iter()
                .any(|glob| matches_glob(&name, glob))
        })
        .count()
}
