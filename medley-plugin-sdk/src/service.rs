//! # Plugin Service Module
//!
//! The plugin-side half of the protocol. A plugin binary implements
//! [`PluginHandler`] and calls [`serve`], which binds a loopback listener,
//! prints the handshake line on stdout, and runs the dispatch loop until
//! the host sends `stop` or the connection drops.
//!
//! Every base-surface method except `info` has a default implementation
//! answering `not_implemented`, so a handler only writes the endpoints it
//! actually supports — the host treats absent optional endpoints as a
//! distinct, non-failing outcome.
//!
//! ```no_run
//! use medley_plugin_sdk::service::{serve, PluginHandler, ServiceError};
//! use medley_plugin_sdk::wire::{PluginInfo, ServiceContext};
//! use medley_plugin_sdk::manifest::PluginKind;
//!
//! struct Enricher;
//!
//! #[async_trait::async_trait]
//! impl PluginHandler for Enricher {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo {
//!             id: "subsense-enricher".into(),
//!             name: "SubSense".into(),
//!             version: "1.4.2".into(),
//!             kind: PluginKind::MetadataEnricher,
//!             description: String::new(),
//!             author: String::new(),
//!         }
//!     }
//!
//!     async fn initialize(&self, _ctx: ServiceContext) -> Result<(), ServiceError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     serve(Enricher).await.unwrap();
//! }
//! ```

use crate::codec::{FrameReader, FrameWriter};
use crate::error::TransportError;
use crate::handshake::Handshake;
use crate::wire::{
    kinds, methods, FileScanned, PluginInfo, RequestEnvelope, ResourceMetrics, ResponseEnvelope,
    ScanCompleted, ScanStarted, ServiceContext, StateSnapshot,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Error a handler returns over the wire.
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub kind: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn not_implemented(method: &str) -> Self {
        Self::new(kinds::NOT_IMPLEMENTED, method)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(kinds::INTERNAL, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(kinds::VALIDATION_FAILED, message)
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ServiceError {}

/// The surface a plugin binary implements.
///
/// `info` is the only mandatory method; the rest default to
/// `not_implemented` or to a harmless no-op where the protocol expects one.
#[async_trait::async_trait]
pub trait PluginHandler: Send + Sync + 'static {
    /// Identity block reported to the host.
    fn info(&self) -> PluginInfo;

    /// Receive the runtime context. Defaults to accepting it.
    async fn initialize(&self, _ctx: ServiceContext) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Begin serving. Defaults to a no-op.
    async fn start(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Stop serving. Defaults to a no-op; the loop exits after replying.
    async fn stop(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Liveness probe. Defaults to healthy.
    async fn health(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Extended resource metrics; optional.
    async fn metrics(&self) -> Result<ResourceMetrics, ServiceError> {
        Err(ServiceError::not_implemented(methods::METRICS))
    }

    /// Data models owned by the plugin; optional.
    async fn get_models(&self) -> Result<Vec<String>, ServiceError> {
        Err(ServiceError::not_implemented(methods::GET_MODELS))
    }

    /// Schema migration hook; optional.
    async fn migrate(&self, _conn_string: String) -> Result<(), ServiceError> {
        Err(ServiceError::not_implemented(methods::MIGRATE))
    }

    /// Media-scan hook; optional.
    async fn on_media_file_scanned(&self, _event: FileScanned) -> Result<(), ServiceError> {
        Err(ServiceError::not_implemented(methods::ON_MEDIA_FILE_SCANNED))
    }

    /// Scan-started hook; optional.
    async fn on_scan_started(&self, _event: ScanStarted) -> Result<(), ServiceError> {
        Err(ServiceError::not_implemented(methods::ON_SCAN_STARTED))
    }

    /// Scan-completed hook; optional.
    async fn on_scan_completed(&self, _event: ScanCompleted) -> Result<(), ServiceError> {
        Err(ServiceError::not_implemented(methods::ON_SCAN_COMPLETED))
    }

    /// State export ahead of a hot reload; optional.
    async fn export_state(&self) -> Result<Value, ServiceError> {
        Err(ServiceError::not_implemented(methods::EXPORT_STATE))
    }

    /// State import after a hot reload; optional.
    async fn import_state(&self, _snapshot: StateSnapshot) -> Result<(), ServiceError> {
        Err(ServiceError::not_implemented(methods::IMPORT_STATE))
    }

    /// Configuration delivery; optional.
    async fn apply_config(&self, _config: Value) -> Result<(), ServiceError> {
        Err(ServiceError::not_implemented(methods::APPLY_CONFIG))
    }

    /// Free-form domain operations. Defaults to `not_implemented`.
    async fn handle(&self, method: &str, _params: Value) -> Result<Value, ServiceError> {
        Err(ServiceError::not_implemented(method))
    }
}

/// Bind a loopback listener, print the handshake line, and serve the host.
///
/// Returns when the host sends `stop`, when the host hangs up, or on a
/// transport error. The handshake line goes to stdout because that is the
/// pre-agreed stream the supervisor reads; regular plugin logging must use
/// stderr.
pub async fn serve<H: PluginHandler>(handler: H) -> Result<(), TransportError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    // The supervisor is blocked on this line.
    println!("{}", Handshake::line_for(addr));
    use std::io::Write as _;
    std::io::stdout().flush()?;

    let (stream, _peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    serve_stream(handler, stream).await
}

/// Serve the dispatch loop over an established stream.
///
/// Split out from [`serve`] so tests can drive a handler over an in-memory
/// duplex pipe without sockets or processes.
pub async fn serve_stream<H, S>(handler: H, stream: S) -> Result<(), TransportError>
where
    H: PluginHandler,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let handler = Arc::new(handler);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);

    // All responses funnel through one writer task; handlers may answer
    // out of order.
    let (resp_tx, mut resp_rx) = mpsc::channel::<ResponseEnvelope>(64);
    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(envelope) = resp_rx.recv().await {
            let body = match serde_json::to_vec(&envelope) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("failed to encode response: {e}");
                    continue;
                }
            };
            if writer.write_frame(&body).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut stopping = false;
    while let Some(body) = reader.read_frame().await? {
        let request: RequestEnvelope = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("discarding malformed request frame: {e}");
                continue;
            }
        };

        if request.method == methods::STOP {
            let outcome = handler.stop().await;
            let envelope = match outcome {
                Ok(()) => ResponseEnvelope::ok(request.id, Value::Null),
                Err(e) => ResponseEnvelope::err(request.id, e.kind, e.message),
            };
            let _ = resp_tx.send(envelope).await;
            stopping = true;
            break;
        }

        let handler = handler.clone();
        let resp_tx = resp_tx.clone();
        tokio::spawn(async move {
            let envelope = dispatch(handler.as_ref(), request).await;
            let _ = resp_tx.send(envelope).await;
        });
    }

    drop(resp_tx);
    let _ = writer_task.await;
    if stopping {
        tracing::info!("plugin stopping on host request");
    }
    Ok(())
}

async fn dispatch<H: PluginHandler>(handler: &H, request: RequestEnvelope) -> ResponseEnvelope {
    let id = request.id;
    let result: Result<Value, ServiceError> = match request.method.as_str() {
        methods::INFO => serde_json::to_value(handler.info())
            .map_err(|e| ServiceError::internal(e.to_string())),
        methods::INITIALIZE => match serde_json::from_value::<ServiceContext>(request.params) {
            Ok(ctx) => handler.initialize(ctx).await.map(|_| Value::Null),
            Err(e) => Err(ServiceError::new(
                kinds::INITIALIZE_FAILED,
                format!("malformed context: {e}"),
            )),
        },
        methods::START => handler.start().await.map(|_| Value::Null),
        methods::HEALTH => handler.health().await.map(|_| Value::Null),
        methods::METRICS => handler
            .metrics()
            .await
            .and_then(|m| serde_json::to_value(m).map_err(|e| ServiceError::internal(e.to_string()))),
        methods::GET_MODELS => handler
            .get_models()
            .await
            .and_then(|m| serde_json::to_value(m).map_err(|e| ServiceError::internal(e.to_string()))),
        methods::MIGRATE => {
            let conn = request
                .params
                .get("connection_string")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            handler.migrate(conn).await.map(|_| Value::Null)
        }
        methods::ON_MEDIA_FILE_SCANNED => {
            match serde_json::from_value::<FileScanned>(request.params) {
                Ok(event) => handler.on_media_file_scanned(event).await.map(|_| Value::Null),
                Err(e) => Err(ServiceError::validation(format!("malformed event: {e}"))),
            }
        }
        methods::ON_SCAN_STARTED => match serde_json::from_value::<ScanStarted>(request.params) {
            Ok(event) => handler.on_scan_started(event).await.map(|_| Value::Null),
            Err(e) => Err(ServiceError::validation(format!("malformed event: {e}"))),
        },
        methods::ON_SCAN_COMPLETED => {
            match serde_json::from_value::<ScanCompleted>(request.params) {
                Ok(event) => handler.on_scan_completed(event).await.map(|_| Value::Null),
                Err(e) => Err(ServiceError::validation(format!("malformed event: {e}"))),
            }
        }
        methods::EXPORT_STATE => handler.export_state().await,
        methods::IMPORT_STATE => match serde_json::from_value::<StateSnapshot>(request.params) {
            Ok(snapshot) => handler.import_state(snapshot).await.map(|_| Value::Null),
            Err(e) => Err(ServiceError::validation(format!("malformed snapshot: {e}"))),
        },
        methods::APPLY_CONFIG => handler.apply_config(request.params).await.map(|_| Value::Null),
        other => handler.handle(other, request.params).await,
    };

    match result {
        Ok(value) => ResponseEnvelope::ok(id, value),
        Err(e) => ResponseEnvelope::err(id, e.kind, e.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PluginClient;
    use crate::error::RuntimeError;
    use crate::manifest::PluginKind;
    use crate::transport::RawTransport;
    use std::time::Duration;

    struct TestPlugin;

    #[async_trait::async_trait]
    impl PluginHandler for TestPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                id: "test-enricher".into(),
                name: "Test".into(),
                version: "0.1.0".into(),
                kind: PluginKind::MetadataEnricher,
                description: String::new(),
                author: String::new(),
            }
        }

        async fn get_models(&self) -> Result<Vec<String>, ServiceError> {
            Ok(vec!["track".into(), "album".into()])
        }

        async fn handle(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
            match method {
                "echo" => Ok(params),
                other => Err(ServiceError::not_implemented(other)),
            }
        }
    }

    fn wired_pair() -> PluginClient {
        let (host_side, plugin_side) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let _ = serve_stream(TestPlugin, plugin_side).await;
        });
        PluginClient::new(Arc::new(RawTransport::from_stream(
            host_side,
            Duration::from_secs(1),
        )))
    }

    #[tokio::test]
    async fn base_surface_round_trips() {
        let client = wired_pair();

        let info = client.info().await.unwrap();
        assert_eq!(info.id, "test-enricher");
        assert_eq!(info.kind, PluginKind::MetadataEnricher);

        client
            .initialize(&ServiceContext {
                plugin_id: "test-enricher".into(),
                storage_url: "sqlite://memory".into(),
                host_addr: "127.0.0.1:0".into(),
                log_level: "info".into(),
                base_dir: "/tmp".into(),
            })
            .await
            .unwrap();
        client.start().await.unwrap();
        client.health().await.unwrap();

        let models = client.get_models().await.unwrap();
        assert_eq!(models, vec!["track", "album"]);
    }

    #[tokio::test]
    async fn domain_operations_route_through_handle() {
        let client = wired_pair();
        let out = client
            .request("echo", serde_json::json!({"title": "Bolero"}))
            .await
            .unwrap();
        assert_eq!(out["title"], "Bolero");
    }

    #[tokio::test]
    async fn absent_endpoints_answer_not_implemented() {
        let client = wired_pair();
        let err = client
            .resource_metrics(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotImplemented { .. }));

        let err = client
            .on_scan_started(&ScanStarted {
                job_id: "j".into(),
                library_id: "l".into(),
                path: "/media".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotImplemented { .. }));
    }

    #[tokio::test]
    async fn stop_ends_the_serve_loop() {
        let (host_side, plugin_side) = tokio::io::duplex(8192);
        let server = tokio::spawn(async move { serve_stream(TestPlugin, plugin_side).await });
        let client = PluginClient::new(Arc::new(RawTransport::from_stream(
            host_side,
            Duration::from_secs(1),
        )));

        client.stop(Duration::from_secs(1)).await.unwrap();
        let served = tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("serve loop should exit after stop")
            .unwrap();
        assert!(served.is_ok());
    }
}
