//! # Persisted Plugin State Module
//!
//! The runtime persists a small record per plugin — identity fields, the
//! desired state, and the install timestamp — so enable/disable decisions
//! survive restarts. The store itself is an opaque sink behind the
//! [`StateStore`] trait; the embedding host wires its real database in,
//! while [`JsonFileStore`] covers the standalone daemon and tests and
//! [`NullStateStore`] covers hosts that opt out.

use crate::registry::DesiredState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// The slice of a plugin record that outlives the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPlugin {
    pub id: String,
    pub desired: DesiredState,
    pub version: String,
    pub installed_at: DateTime<Utc>,
}

/// Opaque persistence sink for plugin state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<PersistedPlugin>>;
    async fn put(&self, plugin: PersistedPlugin) -> anyhow::Result<()>;
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}

/// No-op store for embedders that persist elsewhere.
pub struct NullStateStore;

#[async_trait]
impl StateStore for NullStateStore {
    async fn load_all(&self) -> anyhow::Result<Vec<PersistedPlugin>> {
        Ok(Vec::new())
    }

    async fn put(&self, _plugin: PersistedPlugin) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One-file JSON store with atomic rewrite-and-rename updates.
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    async fn read_map(&self) -> anyhow::Result<HashMap<String, PersistedPlugin>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &HashMap<String, PersistedPlugin>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(map)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_all(&self) -> anyhow::Result<Vec<PersistedPlugin>> {
        let _guard = self.guard.lock().await;
        let map = self.read_map().await?;
        Ok(map.into_values().collect())
    }

    async fn put(&self, plugin: PersistedPlugin) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut map = self.read_map().await?;
        map.insert(plugin.id.clone(), plugin);
        self.write_map(&map).await
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut map = self.read_map().await?;
        if map.remove(id).is_some() {
            self.write_map(&map).await?;
        }
        Ok(())
    }
}
