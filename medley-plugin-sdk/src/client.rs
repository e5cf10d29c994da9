//! # Plugin Client Module
//!
//! [`PluginClient`] is the rich, domain-shaped plugin interface: typed
//! methods for the lifecycle surface, the media-scan hooks, and free-form
//! domain operations. It is an explicit adapter over the transport-shaped
//! [`RawTransport`] — every method serializes a typed payload, issues the
//! call, and maps wire errors into [`RuntimeError`] variants with the right
//! lifecycle flavor (`initialize_failed`, `start_failed`, ...).
//!
//! A `not_implemented` answer from `initialize` or `info` means the binary
//! does not expose the required base surface at all and is reported as
//! `InterfaceMismatch`; on any optional endpoint it is passed through as
//! `NotImplemented`, which callers must not treat as a failure.

use crate::error::{RuntimeError, TransportError};
use crate::transport::RawTransport;
use crate::wire::{
    kinds, methods, FileScanned, PluginInfo, ResourceMetrics, ScanCompleted, ScanStarted,
    ServiceContext, StateSnapshot,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Typed RPC surface of one running plugin.
#[derive(Clone, Debug)]
pub struct PluginClient {
    transport: Arc<RawTransport>,
}

impl PluginClient {
    /// Adapt a raw transport into the domain surface.
    pub fn new(transport: Arc<RawTransport>) -> Self {
        Self { transport }
    }

    /// Access the underlying transport (exit watchers need the closed flag).
    pub fn transport(&self) -> &Arc<RawTransport> {
        &self.transport
    }

    /// Whether the underlying connection is gone.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Deliver the runtime context. Required; part of the base surface.
    pub async fn initialize(&self, ctx: &ServiceContext) -> Result<(), RuntimeError> {
        let params = serde_json::to_value(ctx).map_err(TransportError::from)?;
        match self.transport.call(methods::INITIALIZE, params).await {
            Ok(_) => Ok(()),
            Err(e) => Err(map_lifecycle_error(methods::INITIALIZE, e)),
        }
    }

    /// Start serving. Required; part of the base surface.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        match self.transport.call(methods::START, Value::Null).await {
            Ok(_) => Ok(()),
            Err(e) => Err(map_lifecycle_error(methods::START, e)),
        }
    }

    /// Stop serving; the subprocess exits shortly afterwards.
    pub async fn stop(&self, grace: Duration) -> Result<(), RuntimeError> {
        match self
            .transport
            .call_with_timeout(methods::STOP, Value::Null, grace)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(map_lifecycle_error(methods::STOP, e)),
        }
    }

    /// Identity block. Required; part of the base surface.
    pub async fn info(&self) -> Result<PluginInfo, RuntimeError> {
        let value = match self.transport.call(methods::INFO, Value::Null).await {
            Ok(v) => v,
            Err(e) => return Err(map_lifecycle_error(methods::INFO, e)),
        };
        let info: PluginInfo = serde_json::from_value(value).map_err(TransportError::from)?;
        Ok(info)
    }

    /// Liveness probe.
    pub async fn health(&self) -> Result<(), RuntimeError> {
        self.transport
            .call(methods::HEALTH, Value::Null)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Liveness probe with an explicit deadline (used by the probe loop).
    pub async fn health_with_timeout(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.transport
            .call_with_timeout(methods::HEALTH, Value::Null, timeout)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Extended resource metrics; optional.
    pub async fn resource_metrics(
        &self,
        timeout: Duration,
    ) -> Result<ResourceMetrics, RuntimeError> {
        let value = self
            .transport
            .call_with_timeout(methods::METRICS, Value::Null, timeout)
            .await
            .map_err(map_error)?;
        let metrics: ResourceMetrics =
            serde_json::from_value(value).map_err(TransportError::from)?;
        Ok(metrics)
    }

    /// Names of data models the plugin owns; optional.
    pub async fn get_models(&self) -> Result<Vec<String>, RuntimeError> {
        let value = self
            .transport
            .call(methods::GET_MODELS, Value::Null)
            .await
            .map_err(map_error)?;
        let models: Vec<String> = serde_json::from_value(value).map_err(TransportError::from)?;
        Ok(models)
    }

    /// Run the plugin's schema migrations against `conn_string`; optional.
    pub async fn migrate(&self, conn_string: &str) -> Result<(), RuntimeError> {
        self.transport
            .call(
                methods::MIGRATE,
                serde_json::json!({ "connection_string": conn_string }),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Media-scan hook; optional.
    pub async fn on_media_file_scanned(&self, event: &FileScanned) -> Result<(), RuntimeError> {
        let params = serde_json::to_value(event).map_err(TransportError::from)?;
        self.transport
            .call(methods::ON_MEDIA_FILE_SCANNED, params)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Scan-lifecycle hook; optional.
    pub async fn on_scan_started(&self, event: &ScanStarted) -> Result<(), RuntimeError> {
        let params = serde_json::to_value(event).map_err(TransportError::from)?;
        self.transport
            .call(methods::ON_SCAN_STARTED, params)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Scan-lifecycle hook; optional.
    pub async fn on_scan_completed(&self, event: &ScanCompleted) -> Result<(), RuntimeError> {
        let params = serde_json::to_value(event).map_err(TransportError::from)?;
        self.transport
            .call(methods::ON_SCAN_COMPLETED, params)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Export the plugin's opaque state ahead of a reload; optional.
    pub async fn export_state(&self) -> Result<Value, RuntimeError> {
        self.transport
            .call(methods::EXPORT_STATE, Value::Null)
            .await
            .map_err(map_error)
    }

    /// Deliver a pre-reload snapshot to a fresh instance; optional.
    pub async fn import_state(&self, snapshot: &StateSnapshot) -> Result<(), RuntimeError> {
        let params = serde_json::to_value(snapshot).map_err(TransportError::from)?;
        self.transport
            .call(methods::IMPORT_STATE, params)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Push a configuration object through the configuration path.
    pub async fn apply_config(&self, config: &Value) -> Result<(), RuntimeError> {
        self.transport
            .call(methods::APPLY_CONFIG, config.clone())
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Free-form domain operation, used by the facade's `Request` path.
    pub async fn request(&self, operation: &str, params: Value) -> Result<Value, RuntimeError> {
        self.transport
            .call(operation, params)
            .await
            .map_err(map_error)
    }

    /// Free-form domain operation with an explicit deadline.
    pub async fn request_with_timeout(
        &self,
        operation: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RuntimeError> {
        self.transport
            .call_with_timeout(operation, params, timeout)
            .await
            .map_err(map_error)
    }

    /// Tear down the underlying connection.
    pub fn shutdown(&self) {
        self.transport.shutdown();
    }
}

/// Map transport errors on general calls.
fn map_error(err: TransportError) -> RuntimeError {
    match err {
        TransportError::Timeout => RuntimeError::RequestTimeout,
        TransportError::Remote { kind, message } => RuntimeError::from_wire(&kind, message),
        other => RuntimeError::Transport(other),
    }
}

/// Map transport errors on base-surface lifecycle calls.
///
/// A `not_implemented` here means the required surface is absent, and a
/// generic remote failure takes the lifecycle-specific variant.
fn map_lifecycle_error(method: &str, err: TransportError) -> RuntimeError {
    match err {
        TransportError::Timeout => RuntimeError::RequestTimeout,
        TransportError::Remote { kind, message } => {
            if kind == kinds::NOT_IMPLEMENTED {
                return RuntimeError::InterfaceMismatch {
                    plugin: message,
                    missing: method.to_string(),
                };
            }
            match method {
                methods::INITIALIZE => RuntimeError::InitializeFailed { message },
                methods::START => RuntimeError::StartFailed { message },
                methods::STOP => RuntimeError::StopFailed { message },
                _ => RuntimeError::from_wire(&kind, message),
            }
        }
        other => RuntimeError::Transport(other),
    }
}
