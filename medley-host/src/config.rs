//! # Configuration Management Module
//!
//! Configuration for the Medley plugin runtime: TOML files, environment
//! variable overrides, duration strings, and validation.
//!
//! ## Configuration File Example
//!
//! ```toml
//! [plugins]
//! dir = "/var/lib/medley/plugins"
//! state_file = "/var/lib/medley/plugin-state.json"
//!
//! [host]
//! storage_url = "postgres://localhost/medley"
//! service_addr = "127.0.0.1:7770"
//! plugin_log_level = "info"
//!
//! [auto_enable]
//! honor_manifest_defaults = true
//! always_on_kinds = ["scanner-hook"]
//! force_enabled = ["core-transcoder"]
//!
//! [supervisor]
//! start_timeout = "10s"
//! stop_grace = "5s"
//! request_timeout = "10s"
//!
//! [breaker]
//! failure_threshold = 5
//! recovery_timeout = "30s"
//! success_threshold = 3
//!
//! [health]
//! probe_interval = "30s"
//! probe_timeout = "10s"
//!
//! [fallback]
//! capacity = 1024
//! default_ttl = "24h"
//! sweep_interval = "5m"
//!
//! [hot_reload]
//! enabled = true
//! debounce = "500ms"
//! include_globs = ["*-transcoder", "*-enricher", "*-scanner"]
//! max_retries = 3
//! ```
//!
//! ## Environment Variables
//!
//! - `MEDLEY_PLUGINS_DIR` — override the plugins directory
//! - `MEDLEY_STORAGE_URL` — override the storage connection string
//! - `MEDLEY_SERVICE_ADDR` — override the host service address
//! - `MEDLEY_PLUGIN_LOG_LEVEL` — log level handed to plugin subprocesses
//! - `MEDLEY_STATE_FILE` — override the persisted-state file
//! - `MEDLEY_PROBE_INTERVAL` — override the health probe cadence
//! - `MEDLEY_HOT_RELOAD` — enable/disable the hot-reload controller
//! - `MEDLEY_DEBOUNCE` — override the hot-reload debounce window

use medley_plugin_sdk::circuit_breaker::CircuitBreakerConfig;
use medley_plugin_sdk::fallback::FallbackConfig;
use medley_plugin_sdk::manifest::PluginKind;
use medley_plugin_sdk::supervisor::SupervisorConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::health_monitor::HealthMonitorConfig;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub plugins: PluginsConfig,
    pub host: HostConfig,
    pub auto_enable: AutoEnableConfig,
    pub supervisor: SupervisorConfig,
    pub breaker: CircuitBreakerConfig,
    pub health: HealthMonitorConfig,
    pub fallback: FallbackConfig,
    pub hot_reload: HotReloadConfig,
}

/// Where plugins and their persisted state live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Root directory scanned for plugin subdirectories
    pub dir: PathBuf,
    /// JSON file holding per-plugin desired state; `None` disables
    /// persistence
    pub state_file: Option<PathBuf>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./plugins"),
            state_file: None,
        }
    }
}

/// Values handed to every plugin through the environment contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub storage_url: String,
    pub service_addr: String,
    pub plugin_log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            storage_url: "sqlite://medley.db".into(),
            service_addr: "127.0.0.1:7770".into(),
            plugin_log_level: "info".into(),
        }
    }
}

/// Which plugins get `DesiredState::Enabled` at discovery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoEnableConfig {
    /// Honor `enabled_by_default = true` in manifests
    pub honor_manifest_defaults: bool,
    /// Kinds that are always enabled on this host
    pub always_on_kinds: Vec<PluginKind>,
    /// Plugin ids that are always enabled on this host
    pub force_enabled: Vec<String>,
}

impl Default for AutoEnableConfig {
    fn default() -> Self {
        Self {
            honor_manifest_defaults: true,
            always_on_kinds: Vec::new(),
            force_enabled: Vec::new(),
        }
    }
}

/// Hot-reload controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    pub enabled: bool,
    /// Quiet period after the last filesystem event before a reload fires
    #[serde(with = "medley_plugin_sdk::duration_serde")]
    pub debounce: Duration,
    /// Directory-name globs that opt a plugin into watching
    pub include_globs: Vec<String>,
    /// File suffixes ignored by the watcher (sources, temps, logs)
    pub exclude_suffixes: Vec<String>,
    /// Reload attempts per trigger
    pub max_retries: u32,
    /// Base of the exponential retry backoff
    #[serde(with = "medley_plugin_sdk::duration_serde")]
    pub backoff_base: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(500),
            include_globs: vec![
                "*-transcoder".into(),
                "*-enricher".into(),
                "*-scanner".into(),
            ],
            exclude_suffixes: vec![
                ".tmp".into(),
                ".log".into(),
                ".swp".into(),
                ".part".into(),
                ".go".into(),
                ".rs".into(),
                ".c".into(),
                ".py".into(),
            ],
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RuntimeConfig {
    /// Load a configuration file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let mut config: RuntimeConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `MEDLEY_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(dir) = env::var("MEDLEY_PLUGINS_DIR") {
            self.plugins.dir = PathBuf::from(dir);
        }
        if let Ok(state_file) = env::var("MEDLEY_STATE_FILE") {
            self.plugins.state_file = Some(PathBuf::from(state_file));
        }
        if let Ok(url) = env::var("MEDLEY_STORAGE_URL") {
            self.host.storage_url = url;
        }
        if let Ok(addr) = env::var("MEDLEY_SERVICE_ADDR") {
            self.host.service_addr = addr;
        }
        if let Ok(level) = env::var("MEDLEY_PLUGIN_LOG_LEVEL") {
            self.host.plugin_log_level = level;
        }
        if let Ok(interval) = env::var("MEDLEY_PROBE_INTERVAL") {
            self.health.probe_interval = parse_duration(&interval)?;
        }
        if let Ok(enabled) = env::var("MEDLEY_HOT_RELOAD") {
            self.hot_reload.enabled = matches!(enabled.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Ok(debounce) = env::var("MEDLEY_DEBOUNCE") {
            self.hot_reload.debounce = parse_duration(&debounce)?;
        }
        Ok(())
    }

    /// Validate the whole configuration; called once at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_plugins()?;
        self.validate_supervisor()?;
        self.validate_breaker()?;
        self.validate_health()?;
        self.validate_fallback()?;
        self.validate_hot_reload()?;
        Ok(())
    }

    fn validate_plugins(&self) -> anyhow::Result<()> {
        if self.plugins.dir.as_os_str().is_empty() {
            anyhow::bail!("plugins.dir must not be empty");
        }
        Ok(())
    }

    fn validate_supervisor(&self) -> anyhow::Result<()> {
        if self.supervisor.start_timeout.is_zero() {
            anyhow::bail!("supervisor.start_timeout must be positive");
        }
        if self.supervisor.stop_grace.is_zero() {
            anyhow::bail!("supervisor.stop_grace must be positive");
        }
        if self.supervisor.request_timeout.is_zero() {
            anyhow::bail!("supervisor.request_timeout must be positive");
        }
        Ok(())
    }

    fn validate_breaker(&self) -> anyhow::Result<()> {
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.success_threshold == 0 {
            anyhow::bail!("breaker.success_threshold must be at least 1");
        }
        if self.breaker.sliding_window_size == 0 {
            anyhow::bail!("breaker.sliding_window_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.breaker.window_failure_rate)
            || self.breaker.window_failure_rate == 0.0
        {
            anyhow::bail!("breaker.window_failure_rate must be in (0, 1]");
        }
        Ok(())
    }

    fn validate_health(&self) -> anyhow::Result<()> {
        if self.health.probe_interval.is_zero() {
            anyhow::bail!("health.probe_interval must be positive");
        }
        if self.health.probe_timeout.is_zero() {
            anyhow::bail!("health.probe_timeout must be positive");
        }
        Ok(())
    }

    fn validate_fallback(&self) -> anyhow::Result<()> {
        if self.fallback.capacity == 0 {
            anyhow::bail!("fallback.capacity must be at least 1");
        }
        if self.fallback.sweep_batch == 0 {
            anyhow::bail!("fallback.sweep_batch must be at least 1");
        }
        Ok(())
    }

    fn validate_hot_reload(&self) -> anyhow::Result<()> {
        if self.hot_reload.debounce.is_zero() {
            anyhow::bail!("hot_reload.debounce must be positive");
        }
        if self.hot_reload.max_retries == 0 {
            anyhow::bail!("hot_reload.max_retries must be at least 1");
        }
        Ok(())
    }
}

/// Parse a `"500ms"` / `"30s"` / `"5m"` / `"24h"` duration string.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    medley_plugin_sdk::duration_serde::parse(s).map_err(|e| anyhow::anyhow!(e))
}
