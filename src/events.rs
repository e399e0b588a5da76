//! Lifecycle event bus.
//!
//! Every module state change is broadcast to all subscribers: fan-out over
//! per-subscriber unbounded channels, so publishing never blocks the kernel.
//! Subscribers that dropped their receiver are pruned on the next publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::kernel::descriptor::ModuleDescriptor;

/// A module lifecycle transition. Start-shaped events carry a descriptor
/// snapshot; stop-shaped events carry the bare module name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    Started(ModuleDescriptor),
    Stopped(String),
    Deployed(ModuleDescriptor),
    Removed(String),
    ConfigChanged(ModuleDescriptor),
}

impl LifecycleEvent {
    pub fn module_name(&self) -> &str {
        match self {
            LifecycleEvent::Started(d)
            | LifecycleEvent::Deployed(d)
            | LifecycleEvent::ConfigChanged(d) => &d.name,
            LifecycleEvent::Stopped(name) | LifecycleEvent::Removed(name) => name,
        }
    }
}

/// Event plus publication timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

struct SubscriberEntry {
    id: String,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

/// Fan-out broadcast of lifecycle events.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<SubscriberEntry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; the receiver gets every event published after
    /// this call.
    pub fn subscribe(&self, id: impl Into<String>) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(SubscriberEntry { id: id.into(), tx });
        rx
    }

    /// Broadcast an event; returns the number of live subscribers reached.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|entry| entry.tx.send(envelope.clone()).is_ok());
        debug!(
            module = envelope.event.module_name(),
            delivered = subscribers.len(),
            "published lifecycle event"
        );
        subscribers.len()
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| entry.id.clone())
            .collect()
    }
}
