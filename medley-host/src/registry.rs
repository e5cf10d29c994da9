//! # Plugin Registry Module
//!
//! The process-wide set of discovered plugins, keyed by stable plugin id.
//! The registry is the source of truth for plugin metadata and desired
//! state; runtime state is mirrored in from the supervisors so one read
//! answers "what exists, what should run, what is running".
//!
//! ## Ownership and copy-on-read
//!
//! Entries live behind one reader-writer lock. Nothing hands out references
//! into the map — callers always receive [`PluginSnapshot`] copies, so no
//! alias can observe a half-applied update.
//!
//! ## Upsert and tombstones
//!
//! Rediscovery upserts: name, version, description, and paths overwrite
//! prior values; the id is immutable. A record whose directory vanished is
//! not removed while its process may still be running — it is tombstoned
//! and reaped after the next successful stop.

use crate::config::AutoEnableConfig;
use chrono::{DateTime, Utc};
use medley_plugin_sdk::manifest::{PluginKind, PluginManifest};
use medley_plugin_sdk::supervisor::RuntimeState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Persisted administrative state of a plugin. Only the facade mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Discovered,
    Enabled,
    Disabled,
    Error,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DesiredState::Discovered => "discovered",
            DesiredState::Enabled => "enabled",
            DesiredState::Disabled => "disabled",
            DesiredState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Immutable-ish description of one discovered plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub kind: PluginKind,
    pub version: String,
    pub description: String,
    pub author: String,
    pub manifest_path: PathBuf,
    pub binary_path: PathBuf,
    pub enabled_by_default: bool,
    pub permissions: Vec<String>,
    pub installed_at: DateTime<Utc>,
}

impl PluginRecord {
    /// Build a record from a parsed manifest and its directory.
    pub fn from_manifest(manifest: &PluginManifest, plugin_dir: &Path) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            kind: manifest.kind,
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            manifest_path: plugin_dir.join(medley_plugin_sdk::manifest::MANIFEST_FILE),
            binary_path: manifest.binary_path(plugin_dir),
            enabled_by_default: manifest.enabled_by_default,
            permissions: manifest.permissions.clone(),
            installed_at: Utc::now(),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or(Path::new("."))
    }

    /// Whether host policy auto-enables this plugin at discovery.
    pub fn auto_enabled(&self, policy: &AutoEnableConfig) -> bool {
        (self.enabled_by_default && policy.honor_manifest_defaults)
            || policy.always_on_kinds.contains(&self.kind)
            || policy.force_enabled.iter().any(|id| id == &self.id)
    }
}

#[derive(Debug)]
struct Entry {
    record: PluginRecord,
    desired: DesiredState,
    runtime: RuntimeState,
    tombstoned: bool,
    active_config: Option<Value>,
}

/// Copy-on-read view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub record: PluginRecord,
    pub desired: DesiredState,
    pub runtime: RuntimeState,
    pub tombstoned: bool,
    pub active_config: Option<Value>,
}

/// Result of an upsert, for event emission at the discovery layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Process-wide plugin set behind one coarse reader-writer lock.
pub struct PluginRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a record. The id never changes; a tombstoned entry
    /// that reappears on disk is revived.
    pub async fn upsert(&self, record: PluginRecord) -> UpsertOutcome {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&record.id) {
            Some(entry) => {
                let installed_at = entry.record.installed_at;
                entry.record = record;
                entry.record.installed_at = installed_at;
                entry.tombstoned = false;
                UpsertOutcome::Updated
            }
            None => {
                entries.insert(
                    record.id.clone(),
                    Entry {
                        record,
                        desired: DesiredState::Discovered,
                        runtime: RuntimeState::Stopped,
                        tombstoned: false,
                        active_config: None,
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<PluginSnapshot> {
        self.entries.read().await.get(id).map(snapshot)
    }

    /// All entries, sorted by id for stable listings.
    pub async fn list(&self) -> Vec<PluginSnapshot> {
        let entries = self.entries.read().await;
        let mut all: Vec<PluginSnapshot> = entries.values().map(snapshot).collect();
        all.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        all
    }

    pub async fn set_desired(&self, id: &str, desired: DesiredState) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) => {
                entry.desired = desired;
                true
            }
            None => false,
        }
    }

    pub async fn set_runtime(&self, id: &str, runtime: RuntimeState) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) => {
                entry.runtime = runtime;
                true
            }
            None => false,
        }
    }

    pub async fn set_active_config(&self, id: &str, config: Option<Value>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.active_config = config;
        }
    }

    /// Mark a vanished record for deferred removal.
    pub async fn mark_tombstoned(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.tombstoned = true;
        }
    }

    /// Remove tombstoned entries whose process is fully stopped.
    ///
    /// Returns the reaped ids so the caller can emit removal events and
    /// drop persisted state.
    pub async fn reap_tombstones(&self) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let reapable: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.tombstoned && e.runtime == RuntimeState::Stopped)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &reapable {
            entries.remove(id);
        }
        reapable
    }

    /// Remove an entry outright (used at explicit unregister).
    pub async fn remove(&self, id: &str) -> Option<PluginSnapshot> {
        self.entries.write().await.remove(id).map(|e| snapshot(&e))
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(entry: &Entry) -> PluginSnapshot {
    PluginSnapshot {
        record: entry.record.clone(),
        desired: entry.desired,
        runtime: entry.runtime,
        tombstoned: entry.tombstoned,
        active_config: entry.active_config.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: &str) -> PluginRecord {
        let manifest = PluginManifest::parse(&format!(
            "id = \"{id}\"\nname = \"Test\"\nversion = \"{version}\"\n"
        ))
        .unwrap();
        PluginRecord::from_manifest(&manifest, Path::new("/plugins").join(id).as_path())
    }

    #[tokio::test]
    async fn upsert_refreshes_but_keeps_identity() {
        let registry = PluginRegistry::new();
        assert_eq!(
            registry.upsert(record("x-enricher", "1.0.0")).await,
            UpsertOutcome::Inserted
        );
        let first = registry.get("x-enricher").await.unwrap();
        assert_eq!(first.desired, DesiredState::Discovered);

        assert_eq!(
            registry.upsert(record("x-enricher", "1.0.1")).await,
            UpsertOutcome::Updated
        );
        let second = registry.get("x-enricher").await.unwrap();
        assert_eq!(second.record.version, "1.0.1");
        // Installed timestamp survives the refresh.
        assert_eq!(second.record.installed_at, first.record.installed_at);
    }

    #[tokio::test]
    async fn tombstones_wait_for_a_stop() {
        let registry = PluginRegistry::new();
        registry.upsert(record("t-transcoder", "1.0.0")).await;
        registry
            .set_runtime("t-transcoder", RuntimeState::Running)
            .await;
        registry.mark_tombstoned("t-transcoder").await;

        // Still running: nothing reaped.
        assert!(registry.reap_tombstones().await.is_empty());
        assert!(registry.get("t-transcoder").await.unwrap().tombstoned);

        registry
            .set_runtime("t-transcoder", RuntimeState::Stopped)
            .await;
        assert_eq!(registry.reap_tombstones().await, vec!["t-transcoder"]);
        assert!(registry.get("t-transcoder").await.is_none());
    }

    #[tokio::test]
    async fn reappearing_plugin_clears_its_tombstone() {
        let registry = PluginRegistry::new();
        registry.upsert(record("x", "1.0.0")).await;
        registry.mark_tombstoned("x").await;
        registry.upsert(record("x", "1.0.1")).await;
        assert!(!registry.get("x").await.unwrap().tombstoned);
    }

    #[tokio::test]
    async fn listings_are_sorted_copies() {
        let registry = PluginRegistry::new();
        registry.upsert(record("zeta", "1.0.0")).await;
        registry.upsert(record("alpha", "1.0.0")).await;
        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].record.id, "alpha");
        assert_eq!(list[1].record.id, "zeta");
    }

    #[tokio::test]
    async fn auto_enable_policy_matrix() {
        let manifest = PluginManifest::parse(
            "id = \"t-transcoder\"\nname = \"T\"\ntype = \"transcoder\"\nenabled_by_default = true\n",
        )
        .unwrap();
        let rec = PluginRecord::from_manifest(&manifest, Path::new("/p/t-transcoder"));

        let mut policy = AutoEnableConfig::default();
        assert!(rec.auto_enabled(&policy), "manifest default is honored");

        policy.honor_manifest_defaults = false;
        assert!(!rec.auto_enabled(&policy));

        policy.always_on_kinds = vec![PluginKind::Transcoder];
        assert!(rec.auto_enabled(&policy), "always-on kind wins");

        policy.always_on_kinds.clear();
        policy.force_enabled = vec!["t-transcoder".into()];
        assert!(rec.auto_enabled(&policy), "force-on list wins");
    }
}
