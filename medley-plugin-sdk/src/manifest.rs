//! # Plugin Manifest Module
//!
//! Every plugin directory carries a declarative `plugin.toml` describing the
//! plugin's identity, kind, entry point, permissions, and configuration
//! schema. The manifest is parsed with a real TOML parser into
//! [`PluginManifest`]; only `id` and `name` are required, everything else
//! has a default.
//!
//! ## Example
//!
//! ```toml
//! id = "subsense-enricher"
//! name = "SubSense"
//! version = "1.4.2"
//! description = "Subtitle-aware metadata enrichment"
//! author = "Medley Contributors"
//! type = "metadata-enricher"
//! enabled_by_default = true
//! permissions = ["storage.read", "network.outbound"]
//!
//! [entry_points]
//! main = "subsense"
//!
//! [capabilities]
//! languages = ["en", "de", "ja"]
//!
//! [settings.properties.batch_size]
//! default = 32
//! description = "Files enriched per batch"
//! minimum = 1
//! maximum = 512
//! ```

use crate::error::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File name of the manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Plugin category, affecting auto-enable policy and dashboard wiring.
///
/// Unrecognized kind strings deserialize to [`PluginKind::Other`] so a
/// manifest written for a newer host still loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    MetadataEnricher,
    ScannerHook,
    Transcoder,
    #[default]
    Other,
}

impl<'de> Deserialize<'de> for PluginKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

impl std::str::FromStr for PluginKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "metadata-enricher" => PluginKind::MetadataEnricher,
            "scanner-hook" => PluginKind::ScannerHook,
            "transcoder" => PluginKind::Transcoder,
            _ => PluginKind::Other,
        })
    }
}

impl PluginKind {
    /// Directory-name suffix conventionally used by plugins of this kind.
    ///
    /// Used as the default include set for the hot-reload watcher.
    pub fn dir_suffix(&self) -> Option<&'static str> {
        match self {
            PluginKind::MetadataEnricher => Some("-enricher"),
            PluginKind::ScannerHook => Some("-scanner"),
            PluginKind::Transcoder => Some("-transcoder"),
            PluginKind::Other => None,
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PluginKind::MetadataEnricher => "metadata-enricher",
            PluginKind::ScannerHook => "scanner-hook",
            PluginKind::Transcoder => "transcoder",
            PluginKind::Other => "other",
        };
        f.write_str(label)
    }
}

/// Entry-point table; `main` is relative to the plugin directory and
/// defaults to the plugin id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPoints {
    #[serde(default)]
    pub main: Option<String>,
}

/// Constraints attached to a single settings property.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingProperty {
    /// Default value applied when the host has no stored override
    #[serde(default)]
    pub default: Option<toml::Value>,
    #[serde(default)]
    pub description: String,
    /// Inclusive numeric lower bound
    #[serde(default)]
    pub minimum: Option<f64>,
    /// Inclusive numeric upper bound
    #[serde(default)]
    pub maximum: Option<f64>,
    /// Closed set of allowed values
    #[serde(default, rename = "enum")]
    pub allowed: Option<Vec<toml::Value>>,
}

/// The optional `settings` block: nested properties providing configuration
/// defaults and constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsSchema {
    #[serde(default)]
    pub properties: HashMap<String, SettingProperty>,
}

/// Parsed plugin manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, rename = "type")]
    pub kind: PluginKind,
    #[serde(default)]
    pub enabled_by_default: bool,
    #[serde(default)]
    pub entry_points: EntryPoints,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, toml::Value>,
    #[serde(default)]
    pub settings: Option<SettingsSchema>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl PluginManifest {
    /// Parse a manifest from TOML text, enforcing the required fields.
    pub fn parse(text: &str) -> Result<Self, RuntimeError> {
        let manifest: PluginManifest =
            toml::from_str(text).map_err(|e| RuntimeError::Manifest {
                message: e.to_string(),
            })?;
        if manifest.id.trim().is_empty() {
            return Err(RuntimeError::Manifest {
                message: "manifest field `id` must be non-empty".into(),
            });
        }
        if manifest.name.trim().is_empty() {
            return Err(RuntimeError::Manifest {
                message: "manifest field `name` must be non-empty".into(),
            });
        }
        Ok(manifest)
    }

    /// Load and parse the manifest inside `plugin_dir`.
    pub fn load(plugin_dir: &Path) -> Result<Self, RuntimeError> {
        let path = plugin_dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| RuntimeError::Manifest {
            message: format!("reading {}: {e}", path.display()),
        })?;
        Self::parse(&text)
    }

    /// Absolute path of the plugin executable under `plugin_dir`.
    ///
    /// Falls back to a file named after the plugin id when
    /// `entry_points.main` is absent.
    pub fn binary_path(&self, plugin_dir: &Path) -> PathBuf {
        let name = self
            .entry_points
            .main
            .as_deref()
            .unwrap_or(self.id.as_str());
        plugin_dir.join(name)
    }

    /// Configuration defaults declared by the `settings` block, as a JSON
    /// object suitable for `apply_config`.
    pub fn default_settings(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        if let Some(schema) = &self.settings {
            for (key, prop) in &schema.properties {
                if let Some(default) = &prop.default {
                    if let Ok(v) = serde_json::to_value(default) {
                        out.insert(key.clone(), v);
                    }
                }
            }
        }
        serde_json::Value::Object(out)
    }

    /// Validate a configuration object against the declared constraints.
    ///
    /// Unknown keys are rejected only when a schema is declared; a plugin
    /// without a `settings` block accepts anything.
    pub fn validate_settings(&self, config: &serde_json::Value) -> Result<(), RuntimeError> {
        let Some(schema) = &self.settings else {
            return Ok(());
        };
        let Some(object) = config.as_object() else {
            return Err(RuntimeError::ValidationFailed {
                message: "configuration must be an object".into(),
            });
        };
        for (key, value) in object {
            let Some(prop) = schema.properties.get(key) else {
                return Err(RuntimeError::ValidationFailed {
                    message: format!("unknown setting `{key}`"),
                });
            };
            if let Some(n) = value.as_f64() {
                if let Some(min) = prop.minimum {
                    if n < min {
                        return Err(RuntimeError::ValidationFailed {
                            message: format!("setting `{key}` below minimum {min}"),
                        });
                    }
                }
                if let Some(max) = prop.maximum {
                    if n > max {
                        return Err(RuntimeError::ValidationFailed {
                            message: format!("setting `{key}` above maximum {max}"),
                        });
                    }
                }
            }
            if let Some(allowed) = &prop.allowed {
                let matches = allowed
                    .iter()
                    .filter_map(|v| serde_json::to_value(v).ok())
                    .any(|v| &v == value);
                if !matches {
                    return Err(RuntimeError::ValidationFailed {
                        message: format!("setting `{key}` not in the allowed set"),
                    });
                }
            }
        }
        Ok(())
    }
}
