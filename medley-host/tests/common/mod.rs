//! Shared fixtures for the runtime integration tests.

use medley_host::config::RuntimeConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Locate the `sample-plugin` binary built alongside the workspace tests.
pub fn sample_plugin_binary() -> PathBuf {
    let mut dir = std::env::current_exe().expect("test binary path");
    dir.pop(); // the test executable
    if dir.ends_with("deps") {
        dir.pop();
    }
    let candidate = dir.join("sample-plugin");
    assert!(
        candidate.is_file(),
        "sample-plugin binary not found at {} (build the full workspace)",
        candidate.display()
    );
    candidate
}

/// Install a plugin directory: manifest plus (optionally) the sample
/// binary copied in under the manifest's entry point name.
pub fn install_plugin(root: &Path, dir_name: &str, manifest: &str, with_binary: bool) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.toml"), manifest).unwrap();
    if with_binary {
        let manifest = medley_plugin_sdk::manifest::PluginManifest::parse(manifest).unwrap();
        let target = manifest.binary_path(&dir);
        std::fs::copy(sample_plugin_binary(), &target).unwrap();
    }
    dir
}

/// Configuration tuned for fast tests: short breaker windows, no probe
/// interference, hot reload off unless a test turns it on.
pub fn test_config(plugins_dir: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.plugins.dir = plugins_dir.to_path_buf();
    config.supervisor.start_timeout = Duration::from_secs(10);
    config.supervisor.stop_grace = Duration::from_secs(3);
    config.supervisor.exit_poll_interval = Duration::from_millis(100);
    config.breaker.failure_threshold = 3;
    config.breaker.recovery_timeout = Duration::from_millis(300);
    config.breaker.success_threshold = 2;
    config.breaker.request_timeout = Duration::from_secs(5);
    config.breaker.min_requests = 100;
    config.health.probe_interval = Duration::from_secs(60);
    config.hot_reload.enabled = false;
    config.hot_reload.max_retries = 1;
    config.hot_reload.debounce = Duration::from_millis(300);
    config
}
