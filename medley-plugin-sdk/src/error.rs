//! # Error Handling Module
//!
//! Standardized error types for the Medley plugin runtime. Errors are layered
//! the same way the runtime is: [`TransportError`] covers the framed RPC
//! channel to a single plugin subprocess, and [`RuntimeError`] covers
//! everything a caller of the runtime can observe, including lifecycle
//! failures, breaker decisions, and fallback outcomes.
//!
//! ## Error Categories
//!
//! ### Runtime Errors
//!
//! High-level errors surfaced by the module facade and supervisor:
//! - **Lifecycle**: `BinaryMissing`, `HandshakeFailed`, `InitializeFailed`,
//!   `StartFailed`, `StopFailed`, `PluginCrashed`
//! - **Request path**: `RequestTimeout`, `CircuitOpen`, `NotImplemented`,
//!   `CacheMiss`
//! - **Configuration**: `Manifest`, `ValidationFailed`
//!
//! ### Transport Errors
//!
//! Channel-level errors on the length-framed stream:
//! - **I/O**: connection reset, broken pipe
//! - **Framing**: oversized or malformed frames
//! - **Remote**: an error envelope returned by the plugin, carrying a
//!   machine-readable kind and a human message
//!
//! ## Breaker Accounting
//!
//! Not every error is a failure as far as the circuit breaker is concerned.
//! `CircuitOpen` is the breaker refusing the call (never recorded), and
//! `NotImplemented` is an optional endpoint being absent (also never
//! recorded). [`RuntimeError::counts_as_failure`] encodes the rule in one
//! place so the facade and the notify fan-out agree.

use std::path::PathBuf;
use thiserror::Error;

/// Errors on the framed RPC channel to one plugin subprocess.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying stream I/O failure
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope encode/decode failure
    #[error("transport serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Incoming frame exceeded the protocol limit
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer closed the connection while calls were outstanding
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The per-call deadline elapsed before a response arrived
    #[error("rpc call timed out")]
    Timeout,

    /// The plugin answered with an error envelope
    #[error("remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },
}

/// Errors surfaced by the plugin runtime to its callers.
///
/// Each variant corresponds to one machine-readable kind; the wire
/// representation of plugin-originated kinds is defined in
/// [`crate::wire::kinds`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Unknown plugin id
    #[error("plugin not found: {plugin}")]
    NotFound { plugin: String },

    /// Manifest present but the declared executable is absent
    #[error("plugin binary missing: {path}")]
    BinaryMissing { path: PathBuf },

    /// Magic cookie or protocol version mismatch during startup
    #[error("handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// The plugin does not expose the required base surface
    #[error("plugin {plugin} does not implement the base surface ({missing})")]
    InterfaceMismatch { plugin: String, missing: String },

    /// The plugin reported an error from the initialize lifecycle call
    #[error("initialize failed: {message}")]
    InitializeFailed { message: String },

    /// The plugin reported an error from the start lifecycle call
    #[error("start failed: {message}")]
    StartFailed { message: String },

    /// The plugin reported an error from the stop lifecycle call
    #[error("stop failed: {message}")]
    StopFailed { message: String },

    /// The per-call deadline elapsed
    #[error("request timed out")]
    RequestTimeout,

    /// The circuit breaker refused the call; not counted as a failure
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The subprocess exited unexpectedly
    #[error("plugin crashed: {plugin}")]
    PluginCrashed { plugin: String },

    /// Optional endpoint absent; not counted as a breaker failure
    #[error("not implemented: {method}")]
    NotImplemented { method: String },

    /// Configuration payload rejected by validation
    #[error("validation failed: {message}")]
    ValidationFailed { message: String },

    /// No cached response available on the fallback path
    #[error("cache miss")]
    CacheMiss,

    /// Manifest could not be read or parsed
    #[error("manifest error: {message}")]
    Manifest { message: String },

    /// A plugin-originated error with a kind outside the fixed set
    #[error("plugin error [{kind}]: {message}")]
    Plugin { kind: String, message: String },

    /// Channel-level failure talking to the subprocess
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Host-side filesystem failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Map a wire error kind back to the matching runtime variant.
    ///
    /// Unknown kinds are preserved as [`RuntimeError::Plugin`] so a newer
    /// plugin can surface kinds this host does not know yet.
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            crate::wire::kinds::NOT_IMPLEMENTED => RuntimeError::NotImplemented { method: message },
            crate::wire::kinds::INITIALIZE_FAILED => RuntimeError::InitializeFailed { message },
            crate::wire::kinds::START_FAILED => RuntimeError::StartFailed { message },
            crate::wire::kinds::STOP_FAILED => RuntimeError::StopFailed { message },
            crate::wire::kinds::VALIDATION_FAILED => RuntimeError::ValidationFailed { message },
            other => RuntimeError::Plugin {
                kind: other.to_string(),
                message,
            },
        }
    }

    /// The machine-readable kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::NotFound { .. } => "not_found",
            RuntimeError::BinaryMissing { .. } => "binary_missing",
            RuntimeError::HandshakeFailed { .. } => "handshake_failed",
            RuntimeError::InterfaceMismatch { .. } => "interface_mismatch",
            RuntimeError::InitializeFailed { .. } => "initialize_failed",
            RuntimeError::StartFailed { .. } => "start_failed",
            RuntimeError::StopFailed { .. } => "stop_failed",
            RuntimeError::RequestTimeout => "request_timeout",
            RuntimeError::CircuitOpen => "circuit_open",
            RuntimeError::PluginCrashed { .. } => "plugin_crashed",
            RuntimeError::NotImplemented { .. } => "not_implemented",
            RuntimeError::ValidationFailed { .. } => "validation_failed",
            RuntimeError::CacheMiss => "cache_miss",
            RuntimeError::Manifest { .. } => "manifest",
            RuntimeError::Plugin { .. } => "plugin",
            RuntimeError::Transport(_) => "transport",
            RuntimeError::Io(_) => "io",
        }
    }

    /// Whether this outcome is recorded as a failure by the breaker.
    ///
    /// Blocked calls and absent optional endpoints are excluded by contract.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            RuntimeError::CircuitOpen | RuntimeError::NotImplemented { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_kinds_round_trip_to_variants() {
        let err = RuntimeError::from_wire("not_implemented", "get_models".into());
        assert!(matches!(err, RuntimeError::NotImplemented { .. }));

        let err = RuntimeError::from_wire("validation_failed", "bad field".into());
        assert!(matches!(err, RuntimeError::ValidationFailed { .. }));

        let err = RuntimeError::from_wire("transcode_stalled", "wedged".into());
        match err {
            RuntimeError::Plugin { kind, .. } => assert_eq!(kind, "transcode_stalled"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn breaker_accounting_excludes_blocked_and_unimplemented() {
        assert!(!RuntimeError::CircuitOpen.counts_as_failure());
        assert!(!RuntimeError::NotImplemented {
            method: "metrics".into()
        }
        .counts_as_failure());
        assert!(RuntimeError::RequestTimeout.counts_as_failure());
        assert!(RuntimeError::PluginCrashed {
            plugin: "x".into()
        }
        .counts_as_failure());
    }
}
