//! # Medley Host Runtime
//!
//! The host side of the Medley plugin runtime: discovery, the plugin
//! registry, supervised subprocess lifecycles, health monitoring with
//! per-plugin circuit breakers, cached-response fallbacks, and a
//! file-watching hot-reload controller — all behind one facade.
//!
//! ## Overview
//!
//! The embedding media server interacts with exactly one type,
//! [`module::PluginModule`]. It discovers plugins from a directory of
//! subdirectories (each with a `plugin.toml`), decides which are enabled,
//! and supervises one subprocess per enabled plugin. Every outbound call is
//! gated by a circuit breaker, recorded into rolling health windows, and —
//! for cacheable operations — backed by a last-known-good response cache
//! consulted when the plugin fails or the breaker refuses the call.
//!
//! ## Architecture
//!
//! - **`config`** — TOML configuration, env overrides, validation
//! - **`registry`** — records, desired state, runtime state, tombstones
//! - **`discovery`** — directory scanning and manifest parsing
//! - **`health_monitor`** — health records, breakers, the probe loop
//! - **`hot_reload`** — debounced watcher and staged binary swaps
//! - **`module`** — the facade tying everything together
//! - **`events`** — broadcast lifecycle events
//! - **`state_store`** — persisted desired state behind a trait
//!
//! ## Quick Start
//!
//! ```no_run
//! use medley_host::config::RuntimeConfig;
//! use medley_host::module::PluginModule;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RuntimeConfig::load("medley.toml".as_ref())?;
//!     config.validate()?;
//!
//!     let module = PluginModule::new(config);
//!     module.start().await?;
//!
//!     // ... serve traffic, call module.request(...) etc ...
//!
//!     module.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod events;
pub mod health_monitor;
pub mod hot_reload;
pub mod module;
pub mod registry;
pub mod state_store;

pub use config::RuntimeConfig;
pub use events::{LifecycleEvent, LifecycleEventKind};
pub use module::{PluginModule, PluginResponse};
pub use registry::{DesiredState, PluginRecord, PluginSnapshot};
