//! # Supervisor Module
//!
//! One [`Supervisor`] exclusively owns one plugin subprocess: it spawns the
//! binary with the five-variable environment contract, reads and validates
//! the handshake line within the start timeout, dials the negotiated
//! endpoint, drives `initialize` and `start`, and then hands out the typed
//! client for steady-state calls. No other component may touch the child.
//!
//! ## Crash detection
//!
//! A lightweight watcher task polls the child and the transport's closed
//! flag. When the process exits outside a requested stop, the supervisor
//! clears the transport, flips [`RuntimeState::Crashed`] on its watch
//! channel, and leaves the rest to whoever is subscribed — the desired
//! state of the plugin is explicitly not its business.
//!
//! ## Stop ordering
//!
//! `unload` sends the `stop` RPC, waits up to the grace window for a clean
//! exit, then terminates the process and waits again. Unloading a plugin
//! that is not running is a no-op.

use crate::client::PluginClient;
use crate::error::RuntimeError;
use crate::handshake::Handshake;
use crate::transport::RawTransport;
use crate::wire::{env, ServiceContext};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};

/// In-memory process state of one plugin. Mutated only by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Stopped,
    Loading,
    Running,
    Stopping,
    Crashed,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RuntimeState::Stopped => "stopped",
            RuntimeState::Loading => "loading",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Crashed => "crashed",
        };
        f.write_str(label)
    }
}

/// Timing knobs for one supervised subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bound on spawn-to-handshake, including initialize and start
    #[serde(with = "crate::duration_serde")]
    pub start_timeout: Duration,
    /// Grace window between the stop RPC and forced termination
    #[serde(with = "crate::duration_serde")]
    pub stop_grace: Duration,
    /// Default per-call deadline on the transport
    #[serde(with = "crate::duration_serde")]
    pub request_timeout: Duration,
    /// Exit-watcher poll cadence
    #[serde(with = "crate::duration_serde")]
    pub exit_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            exit_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Everything needed to launch one plugin instance.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub binary_path: PathBuf,
    pub base_dir: PathBuf,
    pub context: ServiceContext,
}

struct Inner {
    child: Option<Child>,
    client: Option<Arc<PluginClient>>,
    /// Bumped on every load/unload so a superseded exit watcher stands down.
    generation: u64,
}

/// Host-side owner of one plugin subprocess's lifecycle.
pub struct Supervisor {
    plugin_id: String,
    config: SupervisorConfig,
    inner: Arc<Mutex<Inner>>,
    state_tx: Arc<watch::Sender<RuntimeState>>,
    /// Serializes load/unload; two lifecycle operations never overlap.
    lifecycle: Mutex<()>,
}

impl Supervisor {
    pub fn new(plugin_id: impl Into<String>, config: SupervisorConfig) -> Self {
        let (state_tx, _) = watch::channel(RuntimeState::Stopped);
        Self {
            plugin_id: plugin_id.into(),
            config,
            inner: Arc::new(Mutex::new(Inner {
                child: None,
                client: None,
                generation: 0,
            })),
            state_tx: Arc::new(state_tx),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Current runtime state.
    pub fn runtime_state(&self) -> RuntimeState {
        *self.state_tx.borrow()
    }

    /// Subscribe to runtime-state transitions.
    pub fn state_watch(&self) -> watch::Receiver<RuntimeState> {
        self.state_tx.subscribe()
    }

    /// The typed client, when the plugin is up.
    pub async fn client(&self) -> Option<Arc<PluginClient>> {
        self.inner.lock().await.client.clone()
    }

    /// Spawn, handshake, initialize, and start the plugin.
    ///
    /// Loading an already-running plugin returns the existing client.
    pub async fn load(&self, spec: &SpawnSpec) -> Result<Arc<PluginClient>, RuntimeError> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let inner = self.inner.lock().await;
            if let Some(client) = &inner.client {
                if !client.is_closed() {
                    return Ok(client.clone());
                }
            }
        }

        if tokio::fs::metadata(&spec.binary_path).await.is_err() {
            return Err(RuntimeError::BinaryMissing {
                path: spec.binary_path.clone(),
            });
        }

        self.set_state(RuntimeState::Loading);
        tracing::info!(plugin = %self.plugin_id, binary = %spec.binary_path.display(), "loading plugin");

        let mut child = match Command::new(&spec.binary_path)
            .current_dir(&spec.base_dir)
            .env(env::PLUGIN_ID, &spec.context.plugin_id)
            .env(env::STORAGE_URL, &spec.context.storage_url)
            .env(env::HOST_ADDR, &spec.context.host_addr)
            .env(env::LOG_LEVEL, &spec.context.log_level)
            .env(env::BASE_DIR, &spec.context.base_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.set_state(RuntimeState::Stopped);
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::BinaryMissing {
                        path: spec.binary_path.clone(),
                    }
                } else {
                    RuntimeError::Io(e)
                });
            }
        };

        // Plugin logging arrives on stderr; stdout is reserved for the
        // handshake line.
        if let Some(stderr) = child.stderr.take() {
            let plugin = self.plugin_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "medley::plugin", plugin = %plugin, "{line}");
                }
            });
        }

        let client = match self.complete_startup(&mut child, spec).await {
            Ok(client) => client,
            Err(e) => {
                kill_quietly(&mut child).await;
                self.set_state(RuntimeState::Stopped);
                return Err(e);
            }
        };

        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.child = Some(child);
            inner.client = Some(client.clone());
            inner.generation
        };
        self.set_state(RuntimeState::Running);
        tracing::info!(plugin = %self.plugin_id, "plugin running");

        self.spawn_exit_watcher(generation, client.transport().closed_watch());
        Ok(client)
    }

    /// Handshake, transport dial, initialize, start — all within StartTimeout.
    async fn complete_startup(
        &self,
        child: &mut Child,
        spec: &SpawnSpec,
    ) -> Result<Arc<PluginClient>, RuntimeError> {
        let stdout = child.stdout.take().ok_or_else(|| RuntimeError::HandshakeFailed {
            reason: "child stdout unavailable".into(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let line = match tokio::time::timeout(self.config.start_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(RuntimeError::HandshakeFailed {
                    reason: "child exited before presenting a handshake".into(),
                })
            }
            Ok(Err(e)) => {
                return Err(RuntimeError::HandshakeFailed {
                    reason: format!("reading handshake: {e}"),
                })
            }
            Err(_) => {
                return Err(RuntimeError::HandshakeFailed {
                    reason: format!(
                        "no handshake within {:?}",
                        self.config.start_timeout
                    ),
                })
            }
        };
        let handshake = Handshake::read(&line)?;

        let transport = tokio::time::timeout(
            self.config.start_timeout,
            RawTransport::connect(handshake.endpoint, self.config.request_timeout),
        )
        .await
        .map_err(|_| RuntimeError::HandshakeFailed {
            reason: format!("dialing {} timed out", handshake.endpoint),
        })??;

        let client = Arc::new(PluginClient::new(Arc::new(transport)));
        client.initialize(&spec.context).await?;
        client.start().await?;
        Ok(client)
    }

    /// Stop the plugin: stop RPC, bounded wait, forced termination.
    ///
    /// Idempotent; unloading a stopped or crashed plugin only settles the
    /// state to `stopped`.
    pub async fn unload(&self) -> Result<(), RuntimeError> {
        let _lifecycle = self.lifecycle.lock().await;

        let (child, client) = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            (inner.child.take(), inner.client.take())
        };

        let Some(mut child) = child else {
            if self.runtime_state() != RuntimeState::Stopped {
                self.set_state(RuntimeState::Stopped);
            }
            return Ok(());
        };

        self.set_state(RuntimeState::Stopping);
        tracing::info!(plugin = %self.plugin_id, "stopping plugin");

        if let Some(client) = &client {
            if let Err(e) = client.stop(self.config.stop_grace).await {
                tracing::warn!(plugin = %self.plugin_id, "stop rpc failed: {e}");
            }
        }

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(plugin = %self.plugin_id, "plugin exited with {status}");
            }
            Ok(Err(e)) => {
                tracing::warn!(plugin = %self.plugin_id, "waiting for exit: {e}");
            }
            Err(_) => {
                tracing::warn!(plugin = %self.plugin_id, "grace window elapsed, terminating");
                if let Err(e) = child.kill().await {
                    tracing::warn!(plugin = %self.plugin_id, "terminate failed: {e}");
                }
            }
        }

        if let Some(client) = client {
            client.shutdown();
        }
        self.set_state(RuntimeState::Stopped);
        Ok(())
    }

    /// Poll the child and the transport; flip to `crashed` on surprise exit.
    fn spawn_exit_watcher(&self, generation: u64, mut closed: watch::Receiver<bool>) {
        let inner = self.inner.clone();
        let state_tx = self.state_tx.clone();
        let plugin = self.plugin_id.clone();
        let poll = self.config.exit_poll_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = closed.changed() => {}
                }

                let mut guard = inner.lock().await;
                if guard.generation != generation {
                    // A lifecycle operation superseded this instance.
                    return;
                }
                let transport_gone =
                    guard.client.as_ref().map(|c| c.is_closed()).unwrap_or(false);
                let Some(child) = guard.child.as_mut() else {
                    return;
                };

                match child.try_wait() {
                    Ok(Some(status)) => {
                        if let Some(client) = &guard.client {
                            client.shutdown();
                        }
                        guard.child = None;
                        guard.client = None;
                        drop(guard);
                        tracing::warn!(plugin = %plugin, "plugin exited unexpectedly ({status})");
                        let _ = state_tx.send(RuntimeState::Crashed);
                        return;
                    }
                    Ok(None) => {
                        // Process alive but transport gone: treat as a crash
                        // in progress and force the exit we are polling for.
                        if transport_gone {
                            let _ = child.start_kill();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(plugin = %plugin, "exit watcher: {e}");
                        return;
                    }
                }
            }
        });
    }

    fn set_state(&self, state: RuntimeState) {
        let _ = self.state_tx.send(state);
    }
}

async fn kill_quietly(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(binary: &str) -> SpawnSpec {
        SpawnSpec {
            binary_path: PathBuf::from(binary),
            base_dir: std::env::temp_dir(),
            context: ServiceContext {
                plugin_id: "t".into(),
                storage_url: "sqlite://memory".into(),
                host_addr: "127.0.0.1:0".into(),
                log_level: "info".into(),
                base_dir: "/tmp".into(),
            },
        }
    }

    #[tokio::test]
    async fn missing_binary_is_reported_before_spawn() {
        let supervisor = Supervisor::new("ghost", SupervisorConfig::default());
        let err = supervisor
            .load(&spec("/nonexistent/plugins/ghost/ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::BinaryMissing { .. }));
        assert_eq!(supervisor.runtime_state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn unload_without_load_is_a_noop() {
        let supervisor = Supervisor::new("idle", SupervisorConfig::default());
        supervisor.unload().await.unwrap();
        supervisor.unload().await.unwrap();
        assert_eq!(supervisor.runtime_state(), RuntimeState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_conforming_binary_fails_the_handshake() {
        let mut config = SupervisorConfig::default();
        config.start_timeout = Duration::from_secs(2);
        let supervisor = Supervisor::new("impostor", config);
        // /bin/echo prints an empty line and exits: not a handshake.
        let err = supervisor.load(&spec("/bin/echo")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::HandshakeFailed { .. }));
        assert_eq!(supervisor.runtime_state(), RuntimeState::Stopped);
        assert!(supervisor.client().await.is_none());
    }
}
