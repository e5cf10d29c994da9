//! # Medley Plugin SDK
//!
//! The protocol- and process-level core of the Medley plugin runtime,
//! shared by the host and by plugin authors.
//!
//! ## Overview
//!
//! A Medley plugin is a separate executable living in its own directory
//! next to a `plugin.toml` manifest. The host spawns it, reads a handshake
//! line from its stdout, dials the negotiated loopback endpoint, and speaks
//! a length-framed JSON RPC over that connection. This crate provides both
//! halves of that conversation plus the guard rails around it:
//!
//! - **`manifest`** — the manifest model and TOML parser
//! - **`wire` / `codec`** — envelopes, method names, error kinds, framing
//! - **`handshake`** — cookie and protocol-version validation
//! - **`transport` / `client`** — the transport-shaped RPC client and the
//!   typed domain adapter over it
//! - **`supervisor`** — subprocess spawning, crash detection, graceful stop
//! - **`circuit_breaker`** — the per-plugin three-state call gate
//! - **`health`** — rolling health accounting and trend analysis
//! - **`fallback`** — the bounded last-known-good response cache
//! - **`service`** — the plugin-side serving loop for plugin authors
//!
//! ## Writing a plugin
//!
//! ```no_run
//! use medley_plugin_sdk::manifest::PluginKind;
//! use medley_plugin_sdk::service::{serve, PluginHandler};
//! use medley_plugin_sdk::wire::PluginInfo;
//!
//! struct MyPlugin;
//!
//! #[async_trait::async_trait]
//! impl PluginHandler for MyPlugin {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo {
//!             id: "my-transcoder".into(),
//!             name: "My Transcoder".into(),
//!             version: "0.1.0".into(),
//!             kind: PluginKind::Transcoder,
//!             description: String::new(),
//!             author: String::new(),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     serve(MyPlugin).await.unwrap();
//! }
//! ```
//!
//! ## Supervising a plugin
//!
//! ```no_run
//! use medley_plugin_sdk::supervisor::{SpawnSpec, Supervisor, SupervisorConfig};
//! use medley_plugin_sdk::wire::ServiceContext;
//!
//! # async fn run() -> Result<(), medley_plugin_sdk::error::RuntimeError> {
//! let supervisor = Supervisor::new("my-transcoder", SupervisorConfig::default());
//! let client = supervisor
//!     .load(&SpawnSpec {
//!         binary_path: "/var/lib/medley/plugins/my-transcoder/my-transcoder".into(),
//!         base_dir: "/var/lib/medley/plugins/my-transcoder".into(),
//!         context: ServiceContext {
//!             plugin_id: "my-transcoder".into(),
//!             storage_url: "postgres://localhost/medley".into(),
//!             host_addr: "127.0.0.1:7770".into(),
//!             log_level: "info".into(),
//!             base_dir: "/var/lib/medley/plugins/my-transcoder".into(),
//!         },
//!     })
//!     .await?;
//! client.health().await?;
//! supervisor.unload().await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod client;
pub mod codec;
pub mod duration_serde;
pub mod error;
pub mod fallback;
pub mod handshake;
pub mod health;
pub mod manifest;
pub mod service;
pub mod supervisor;
pub mod transport;
pub mod wire;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::PluginClient;
pub use error::{RuntimeError, TransportError};
pub use fallback::{FallbackRequest, FallbackResponse, FallbackStore, FallbackStrategy};
pub use handshake::Handshake;
pub use health::{HealthSnapshot, HealthState, HealthStatus, HealthThresholds, Trend};
pub use manifest::{PluginKind, PluginManifest};
pub use supervisor::{RuntimeState, SpawnSpec, Supervisor, SupervisorConfig};
pub use transport::RawTransport;
pub use wire::{PluginInfo, ResourceMetrics, ServiceContext};
