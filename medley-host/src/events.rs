//! Lifecycle event bus.
//!
//! Every observable transition in the runtime — discovery, enable/disable,
//! load, stop, crash, reload outcomes, removal — is published as a
//! [`LifecycleEvent`] on a broadcast channel. Subscribers that fall behind
//! lose old events rather than blocking the runtime.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// What happened to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LifecycleEventKind {
    Discovered,
    Enabled,
    Disabled,
    Loaded,
    Stopped,
    Crashed,
    Removed,
    LoadFailed {
        error: String,
    },
    ReloadSucceeded {
        old_version: String,
        new_version: String,
    },
    ReloadFailed {
        error: String,
    },
}

/// One published lifecycle transition.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub plugin_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LifecycleEventKind,
}

impl LifecycleEvent {
    pub fn new(plugin_id: impl Into<String>, kind: LifecycleEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            at: Utc::now(),
            kind,
        }
    }
}

/// Broadcast fan-out of lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn emit(&self, plugin_id: &str, kind: LifecycleEventKind) {
        let event = LifecycleEvent::new(plugin_id, kind);
        tracing::debug!(plugin = %event.plugin_id, event = ?event.kind, "lifecycle event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit("x-enricher", LifecycleEventKind::Discovered);
        bus.emit(
            "x-enricher",
            LifecycleEventKind::ReloadSucceeded {
                old_version: "1.0.0".into(),
                new_version: "1.0.1".into(),
            },
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.plugin_id, "x-enricher");
        assert_eq!(first.kind, LifecycleEventKind::Discovered);

        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.kind,
            LifecycleEventKind::ReloadSucceeded { .. }
        ));
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit("lonely", LifecycleEventKind::Stopped);
    }
}
