//! Lifecycle events published to the notification layer
//!
//! Every event is addressed to one device id. The push transport that
//! forwards them to browsers subscribes through [`EventBus::subscribe`].

use crate::identity::{DeviceId, Identity};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    CredentialChallenge {
        device_id: DeviceId,
        payload: String,
    },
    Authenticated {
        device_id: DeviceId,
    },
    Ready {
        device_id: DeviceId,
        identity: Identity,
        metadata: serde_json::Value,
    },
    AuthFailed {
        device_id: DeviceId,
        reason: String,
    },
    Disconnected {
        device_id: DeviceId,
        reason: String,
    },
    LowBalance {
        device_id: DeviceId,
        identity: Identity,
        balance_minutes: f64,
    },
}

impl SessionEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            SessionEvent::CredentialChallenge { device_id, .. }
            | SessionEvent::Authenticated { device_id }
            | SessionEvent::Ready { device_id, .. }
            | SessionEvent::AuthFailed { device_id, .. }
            | SessionEvent::Disconnected { device_id, .. }
            | SessionEvent::LowBalance { device_id, .. } => device_id,
        }
    }
}

/// Fan-out of session events; publishing without subscribers is fine
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        trace!(device = %event.device_id(), ?event, "publishing session event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
