//! # Wire Protocol Module
//!
//! The host and each plugin subprocess speak a length-framed JSON protocol
//! over one TCP connection negotiated at handshake time. Every frame is a
//! 4-byte big-endian length prefix followed by a JSON envelope; requests
//! carry `{id, method, params}` and responses carry `{id, result}` or
//! `{id, error: {kind, message}}`.
//!
//! This module defines the envelopes, the method-name constants for the base
//! surface every plugin may implement, the machine-readable error kinds, the
//! environment-variable contract passed to the child, and the typed payloads
//! that cross the wire (plugin info, the initialize context, scan events,
//! resource metrics).
//!
//! Frames are capped at [`MAX_FRAME_LEN`]; a peer announcing a larger frame
//! is treated as corrupt and the connection is dropped.

use crate::manifest::PluginKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Protocol version spoken by this crate. Handshake requires exact equality.
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic cookie pair the child must present during handshake.
///
/// The value is arbitrary but fixed; it exists to stop the host from
/// speaking the protocol at an unrelated executable that happens to live in
/// a plugin directory.
pub const COOKIE_KEY: &str = "MEDLEY_PLUGIN";
pub const COOKIE_VALUE: &str = "6f1c29d4a8b35e70";

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Environment variables passed to every plugin subprocess.
///
/// This is the complete implicit contract; plugins must not rely on any
/// other inherited state.
pub mod env {
    pub const PLUGIN_ID: &str = "MEDLEY_PLUGIN_ID";
    pub const STORAGE_URL: &str = "MEDLEY_STORAGE_URL";
    pub const HOST_ADDR: &str = "MEDLEY_HOST_ADDR";
    pub const LOG_LEVEL: &str = "MEDLEY_LOG_LEVEL";
    pub const BASE_DIR: &str = "MEDLEY_BASE_DIR";
}

/// Method names of the base RPC surface.
///
/// A plugin may implement any subset; absent methods answer with the
/// `not_implemented` error kind.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const INFO: &str = "info";
    pub const HEALTH: &str = "health";
    pub const METRICS: &str = "metrics";
    pub const GET_MODELS: &str = "get_models";
    pub const MIGRATE: &str = "migrate";
    pub const ON_MEDIA_FILE_SCANNED: &str = "on_media_file_scanned";
    pub const ON_SCAN_STARTED: &str = "on_scan_started";
    pub const ON_SCAN_COMPLETED: &str = "on_scan_completed";
    pub const EXPORT_STATE: &str = "export_state";
    pub const IMPORT_STATE: &str = "import_state";
    pub const APPLY_CONFIG: &str = "apply_config";
}

/// Machine-readable error kinds carried in error envelopes.
pub mod kinds {
    pub const NOT_IMPLEMENTED: &str = "not_implemented";
    pub const INITIALIZE_FAILED: &str = "initialize_failed";
    pub const START_FAILED: &str = "start_failed";
    pub const STOP_FAILED: &str = "stop_failed";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const INTERNAL: &str = "internal";
}

/// A request envelope: host → plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, unique per connection
    pub id: u64,
    /// Method name, one of [`methods`] or a free-form domain operation
    pub method: String,
    /// Method parameters; `null` when the method takes none
    #[serde(default)]
    pub params: Value,
}

/// A response envelope: plugin → host.
///
/// Exactly one of `result` and `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseEnvelope {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }
}

/// An error payload inside a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

/// Identity block a plugin reports from `info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
}

/// Runtime context delivered with `initialize`.
///
/// The same five values are also exported to the child through the
/// [`env`] variables so a plugin can bootstrap before its transport is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceContext {
    pub plugin_id: String,
    pub storage_url: String,
    pub host_addr: String,
    pub log_level: String,
    pub base_dir: String,
}

/// Extended resource metrics from the optional `metrics` endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

/// Payload of `on_media_file_scanned`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileScanned {
    pub media_id: String,
    pub path: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Payload of `on_scan_started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStarted {
    pub job_id: String,
    pub library_id: String,
    pub path: String,
}

/// Aggregate counters reported when a library scan finishes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub files_seen: u64,
    pub files_added: u64,
    pub files_updated: u64,
    pub files_removed: u64,
}

/// Payload of `on_scan_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCompleted {
    pub job_id: String,
    pub library_id: String,
    pub stats: ScanStats,
}

/// State captured before a hot reload and restored into the new instance.
///
/// `opaque` is whatever the old instance returned from `export_state`; the
/// runtime never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
}
