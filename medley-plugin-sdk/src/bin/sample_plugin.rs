//! Reference plugin used by the supervisor integration tests and as a
//! starting point for plugin authors.
//!
//! Implements the base surface plus a handful of demo operations:
//! `echo` returns its parameters, `flaky` fails on demand (driving circuit
//! breaker tests), `terminate` exits the process abruptly (driving crash
//! detection tests), and the state hooks round-trip an opaque blob across
//! reloads.
//!
//! With `MEDLEY_SAMPLE_BAD_COOKIE=1` in the environment the binary prints a
//! deliberately wrong handshake line and hangs, for handshake-mismatch
//! tests.

use medley_plugin_sdk::manifest::PluginKind;
use medley_plugin_sdk::service::{serve, PluginHandler, ServiceError};
use medley_plugin_sdk::wire::{
    FileScanned, PluginInfo, ResourceMetrics, ScanCompleted, ScanStarted, ServiceContext,
    StateSnapshot,
};
use serde_json::{json, Value};
use std::sync::Mutex;

struct SamplePlugin {
    context: Mutex<Option<ServiceContext>>,
    config: Mutex<Value>,
    scanned_files: Mutex<u64>,
    armed_failures: Mutex<u32>,
}

impl SamplePlugin {
    fn new() -> Self {
        Self {
            context: Mutex::new(None),
            config: Mutex::new(Value::Null),
            scanned_files: Mutex::new(0),
            armed_failures: Mutex::new(0),
        }
    }
}

#[async_trait::async_trait]
impl PluginHandler for SamplePlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "sample-enricher".into(),
            name: "Sample".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            kind: PluginKind::MetadataEnricher,
            description: "Reference plugin for the Medley SDK".into(),
            author: "Medley Contributors".into(),
        }
    }

    async fn initialize(&self, ctx: ServiceContext) -> Result<(), ServiceError> {
        eprintln!("sample plugin initialized as {}", ctx.plugin_id);
        *self.context.lock().unwrap() = Some(ctx);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        eprintln!("sample plugin stopping");
        Ok(())
    }

    async fn metrics(&self) -> Result<ResourceMetrics, ServiceError> {
        Ok(ResourceMetrics {
            memory_bytes: 24 * 1024 * 1024,
            cpu_percent: 1.5,
        })
    }

    async fn get_models(&self) -> Result<Vec<String>, ServiceError> {
        Ok(vec!["sample_annotations".into()])
    }

    async fn on_media_file_scanned(&self, event: FileScanned) -> Result<(), ServiceError> {
        *self.scanned_files.lock().unwrap() += 1;
        eprintln!("saw scanned file {}", event.path);
        Ok(())
    }

    async fn on_scan_started(&self, event: ScanStarted) -> Result<(), ServiceError> {
        eprintln!("scan {} started on {}", event.job_id, event.path);
        Ok(())
    }

    async fn on_scan_completed(&self, event: ScanCompleted) -> Result<(), ServiceError> {
        eprintln!(
            "scan {} completed, {} files seen",
            event.job_id, event.stats.files_seen
        );
        Ok(())
    }

    async fn export_state(&self) -> Result<Value, ServiceError> {
        Ok(json!({
            "scanned_files": *self.scanned_files.lock().unwrap(),
            "note": "sample opaque state",
        }))
    }

    async fn import_state(&self, snapshot: StateSnapshot) -> Result<(), ServiceError> {
        if let Some(opaque) = &snapshot.opaque {
            if let Some(count) = opaque.get("scanned_files").and_then(Value::as_u64) {
                *self.scanned_files.lock().unwrap() = count;
            }
        }
        if let Some(config) = snapshot.config {
            *self.config.lock().unwrap() = config;
        }
        Ok(())
    }

    async fn apply_config(&self, config: Value) -> Result<(), ServiceError> {
        if !config.is_object() && !config.is_null() {
            return Err(ServiceError::validation("configuration must be an object"));
        }
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    async fn handle(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "echo" => Ok(params),
            "flaky" => {
                let mut armed = self.armed_failures.lock().unwrap();
                if *armed > 0 {
                    *armed -= 1;
                    return Err(ServiceError::internal("induced failure"));
                }
                if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                    Err(ServiceError::internal("induced failure"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
            "arm_failures" => {
                let count = params.get("count").and_then(Value::as_u64).unwrap_or(1);
                *self.armed_failures.lock().unwrap() = count as u32;
                Ok(json!({"armed": count}))
            }
            "current_config" => Ok(self.config.lock().unwrap().clone()),
            "current_context" => {
                let context = self.context.lock().unwrap().clone();
                serde_json::to_value(context)
                    .map_err(|e| ServiceError::internal(e.to_string()))
            }
            "scanned_count" => Ok(json!(*self.scanned_files.lock().unwrap())),
            "terminate" => {
                // Crash on purpose; the supervisor should notice.
                eprintln!("sample plugin terminating abruptly");
                std::process::exit(3);
            }
            other => Err(ServiceError::not_implemented(other)),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if std::env::var("MEDLEY_SAMPLE_BAD_COOKIE").is_ok() {
        // Wrong cookie, plausible shape: the host must refuse to proceed.
        println!("MEDLEY_PLUGIN|ffffffffffffffff|1|tcp|127.0.0.1:1");
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        return;
    }

    if let Err(e) = serve(SamplePlugin::new()).await {
        eprintln!("sample plugin transport error: {e}");
        std::process::exit(1);
    }
}
