//! # Plugin Discovery Module
//!
//! Scans the plugins root directory and turns each immediate subdirectory
//! with a manifest into a [`PluginRecord`]. Directories without a manifest
//! are ignored; a manifest that fails to parse is logged and skipped so one
//! broken plugin cannot block discovery of the rest.

use crate::registry::PluginRecord;
use medley_plugin_sdk::manifest::{PluginManifest, MANIFEST_FILE};
use std::path::Path;

/// One discovered candidate: the parsed manifest and its directory.
#[derive(Debug)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub record: PluginRecord,
}

/// Scan `plugins_dir` for plugin candidates.
///
/// Only immediate subdirectories are considered; nesting is a plugin's own
/// business. Results are sorted by id so repeated scans are stable.
pub async fn scan(plugins_dir: &Path) -> std::io::Result<Vec<DiscoveredPlugin>> {
    let mut discovered = Vec::new();
    let mut dir = match tokio::fs::read_dir(plugins_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                "plugins directory {} does not exist yet",
                plugins_dir.display()
            );
            return Ok(discovered);
        }
        Err(e) => return Err(e),
    };

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if !path.join(MANIFEST_FILE).is_file() {
            tracing::debug!("skipping {}: no {MANIFEST_FILE}", path.display());
            continue;
        }
        match PluginManifest::load(&path) {
            Ok(manifest) => {
                let record = PluginRecord::from_manifest(&manifest, &path);
                tracing::info!(
                    plugin = %record.id,
                    version = %record.version,
                    kind = %record.kind,
                    "discovered plugin in {}",
                    path.display()
                );
                discovered.push(DiscoveredPlugin { manifest, record });
            }
            Err(e) => {
                tracing::error!("skipping {}: {e}", path.display());
            }
        }
    }

    discovered.sort_by(|a, b| a.record.id.cmp(&b.record.id));
    Ok(discovered)
}
