//! End-to-end supervisor tests against the real `sample-plugin` binary.

use medley_plugin_sdk::error::RuntimeError;
use medley_plugin_sdk::manifest::PluginKind;
use medley_plugin_sdk::supervisor::{RuntimeState, SpawnSpec, Supervisor, SupervisorConfig};
use medley_plugin_sdk::wire::{FileScanned, ServiceContext};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

fn sample_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sample-plugin"))
}

fn spawn_spec() -> SpawnSpec {
    let binary_path = sample_binary();
    let base_dir = binary_path.parent().unwrap().to_path_buf();
    SpawnSpec {
        binary_path,
        base_dir: base_dir.clone(),
        context: ServiceContext {
            plugin_id: "sample-enricher".into(),
            storage_url: "sqlite://memory".into(),
            host_addr: "127.0.0.1:0".into(),
            log_level: "debug".into(),
            base_dir: base_dir.display().to_string(),
        },
    }
}

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        start_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_secs(3),
        request_timeout: Duration::from_secs(5),
        exit_poll_interval: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn full_lifecycle_round_trip() {
    let supervisor = Supervisor::new("sample-enricher", test_config());
    assert_eq!(supervisor.runtime_state(), RuntimeState::Stopped);

    let client = supervisor.load(&spawn_spec()).await.unwrap();
    assert_eq!(supervisor.runtime_state(), RuntimeState::Running);

    let info = client.info().await.unwrap();
    assert_eq!(info.id, "sample-enricher");
    assert_eq!(info.kind, PluginKind::MetadataEnricher);

    client.health().await.unwrap();

    let metrics = client.resource_metrics(Duration::from_secs(2)).await.unwrap();
    assert!(metrics.memory_bytes > 0);

    let echoed = client
        .request("echo", json!({"title": "Koyaanisqatsi"}))
        .await
        .unwrap();
    assert_eq!(echoed["title"], "Koyaanisqatsi");

    supervisor.unload().await.unwrap();
    assert_eq!(supervisor.runtime_state(), RuntimeState::Stopped);
    assert!(supervisor.client().await.is_none());

    // Unload is idempotent.
    supervisor.unload().await.unwrap();
    assert_eq!(supervisor.runtime_state(), RuntimeState::Stopped);
}

#[tokio::test]
async fn loading_twice_reuses_the_running_instance() {
    let supervisor = Supervisor::new("sample-enricher", test_config());
    let first = supervisor.load(&spawn_spec()).await.unwrap();
    let second = supervisor.load(&spawn_spec()).await.unwrap();
    // Same transport underneath: a call through either works.
    first.health().await.unwrap();
    second.health().await.unwrap();
    supervisor.unload().await.unwrap();
}

#[tokio::test]
async fn notification_hooks_reach_the_plugin() {
    let supervisor = Supervisor::new("sample-enricher", test_config());
    let client = supervisor.load(&spawn_spec()).await.unwrap();

    client
        .on_media_file_scanned(&FileScanned {
            media_id: "m-1".into(),
            path: "/media/movies/a.mkv".into(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
    client
        .on_media_file_scanned(&FileScanned {
            media_id: "m-2".into(),
            path: "/media/movies/b.mkv".into(),
            metadata: Default::default(),
        })
        .await
        .unwrap();

    let count = client.request("scanned_count", serde_json::Value::Null).await.unwrap();
    assert_eq!(count, json!(2));
    supervisor.unload().await.unwrap();
}

#[tokio::test]
async fn state_export_survives_a_restart() {
    let supervisor = Supervisor::new("sample-enricher", test_config());
    let client = supervisor.load(&spawn_spec()).await.unwrap();

    client
        .on_media_file_scanned(&FileScanned {
            media_id: "m-1".into(),
            path: "/media/a.mkv".into(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
    let exported = client.export_state().await.unwrap();
    assert_eq!(exported["scanned_files"], 1);

    supervisor.unload().await.unwrap();

    let client = supervisor.load(&spawn_spec()).await.unwrap();
    client
        .import_state(&medley_plugin_sdk::wire::StateSnapshot {
            version: "0.3.1".into(),
            config: None,
            opaque: Some(exported),
            last_activity: None,
        })
        .await
        .unwrap();
    let count = client.request("scanned_count", serde_json::Value::Null).await.unwrap();
    assert_eq!(count, json!(1));
    supervisor.unload().await.unwrap();
}

#[tokio::test]
async fn abrupt_exit_is_detected_as_a_crash() {
    let supervisor = Supervisor::new("sample-enricher", test_config());
    let client = supervisor.load(&spawn_spec()).await.unwrap();
    let mut states = supervisor.state_watch();

    // The plugin exits before answering; the call fails either way.
    let _ = client.request("terminate", serde_json::Value::Null).await;

    let crashed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *states.borrow() == RuntimeState::Crashed {
                return true;
            }
            if states.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .expect("crash should be observed within the timeout");
    assert!(crashed);
    assert!(supervisor.client().await.is_none());

    // A crashed plugin can be loaded again.
    supervisor.load(&spawn_spec()).await.unwrap();
    assert_eq!(supervisor.runtime_state(), RuntimeState::Running);
    supervisor.unload().await.unwrap();
}

#[tokio::test]
async fn unimplemented_operations_are_distinguishable() {
    let supervisor = Supervisor::new("sample-enricher", test_config());
    let client = supervisor.load(&spawn_spec()).await.unwrap();

    let err = client
        .request("align_subtitles", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotImplemented { .. }));
    assert!(!err.counts_as_failure());

    supervisor.unload().await.unwrap();
}
