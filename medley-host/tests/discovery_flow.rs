//! Discovery, auto-enable, and the missing-binary load path.

mod common;

use common::{install_plugin, test_config};
use medley_host::module::PluginModule;
use medley_host::registry::DesiredState;
use medley_plugin_sdk::error::RuntimeError;
use medley_plugin_sdk::manifest::PluginKind;
use medley_plugin_sdk::supervisor::RuntimeState;

#[tokio::test]
async fn discovery_with_missing_binary_yields_error_state() {
    let root = tempfile::tempdir().unwrap();
    install_plugin(
        root.path(),
        "x-enricher",
        "id = \"x-enricher\"\nname = \"X\"\nversion = \"1.0.0\"\nenabled_by_default = true\n",
        false,
    );

    let module = PluginModule::new(test_config(root.path()));
    module.refresh().await.unwrap();

    // The record exists and the manifest default enabled it.
    let snapshot = module.get("x-enricher").await.unwrap();
    assert_eq!(snapshot.desired, DesiredState::Enabled);
    assert_eq!(snapshot.runtime, RuntimeState::Stopped);
    assert_eq!(snapshot.record.version, "1.0.0");

    // Loading fails on the absent executable; the record enters error.
    let err = module.load("x-enricher").await.unwrap_err();
    assert!(matches!(err, RuntimeError::BinaryMissing { .. }));
    assert_eq!(
        module.get("x-enricher").await.unwrap().desired,
        DesiredState::Error
    );

    // Health was never registered for the phantom instance.
    assert!(module.health("x-enricher").await.is_err());
    assert!(module.health_all().is_empty());
}

#[tokio::test]
async fn auto_enable_policy_applies_at_discovery_only() {
    let root = tempfile::tempdir().unwrap();
    install_plugin(
        root.path(),
        "quiet-enricher",
        "id = \"quiet-enricher\"\nname = \"Quiet\"\n",
        false,
    );
    install_plugin(
        root.path(),
        "eager-scanner",
        "id = \"eager-scanner\"\nname = \"Eager\"\ntype = \"scanner-hook\"\n",
        false,
    );

    let mut config = test_config(root.path());
    config.auto_enable.always_on_kinds = vec![PluginKind::ScannerHook];
    let module = PluginModule::new(config);
    module.refresh().await.unwrap();

    assert_eq!(
        module.get("quiet-enricher").await.unwrap().desired,
        DesiredState::Discovered
    );
    assert_eq!(
        module.get("eager-scanner").await.unwrap().desired,
        DesiredState::Enabled
    );

    // A manual disable is not overridden by rediscovery.
    module.disable("eager-scanner").await.unwrap();
    module.refresh().await.unwrap();
    assert_eq!(
        module.get("eager-scanner").await.unwrap().desired,
        DesiredState::Disabled
    );
}

#[tokio::test]
async fn rediscovery_updates_metadata_and_tombstones_the_vanished() {
    let root = tempfile::tempdir().unwrap();
    let dir = install_plugin(
        root.path(),
        "x-enricher",
        "id = \"x-enricher\"\nname = \"X\"\nversion = \"1.0.0\"\n",
        false,
    );

    let module = PluginModule::new(test_config(root.path()));
    module.refresh().await.unwrap();
    assert_eq!(
        module.get("x-enricher").await.unwrap().record.version,
        "1.0.0"
    );

    // Manifest update on disk flows into the record; the id stays.
    std::fs::write(
        dir.join("plugin.toml"),
        "id = \"x-enricher\"\nname = \"X Prime\"\nversion = \"1.1.0\"\n",
    )
    .unwrap();
    module.refresh().await.unwrap();
    let snapshot = module.get("x-enricher").await.unwrap();
    assert_eq!(snapshot.record.version, "1.1.0");
    assert_eq!(snapshot.record.name, "X Prime");

    // Removing the directory reaps the stopped record on the next refresh.
    std::fs::remove_dir_all(&dir).unwrap();
    module.refresh().await.unwrap();
    assert!(module.get("x-enricher").await.is_err());
}

#[tokio::test]
async fn unknown_plugins_are_not_found() {
    let root = tempfile::tempdir().unwrap();
    let module = PluginModule::new(test_config(root.path()));
    module.refresh().await.unwrap();

    assert!(matches!(
        module.load("ghost").await.unwrap_err(),
        RuntimeError::NotFound { .. }
    ));
    assert!(matches!(
        module.enable("ghost").await.unwrap_err(),
        RuntimeError::NotFound { .. }
    ));
    assert!(matches!(
        module
            .request("ghost", "echo", serde_json::json!({}), false)
            .await
            .unwrap_err(),
        RuntimeError::NotFound { .. }
    ));
}
