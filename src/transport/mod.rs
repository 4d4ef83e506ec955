//! Messaging provider seam
//!
//! The core only ever talks to a provider through these traits. A provider
//! hands out one [`ProviderConnection`] per device and reports lifecycle and
//! inbound traffic back through the [`ProviderEvents`] capability it was
//! given at connect time.

pub mod loopback;

use crate::error::Result;
use crate::identity::{DeviceId, Identity};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// How the provider should persist device credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStrategy {
    /// Nothing persisted; every connect needs a fresh scan
    Ephemeral,
    /// Credentials stored under a client id
    Stored { client_id: String },
}

impl CredentialStrategy {
    /// Stored credentials keyed by the device id
    pub fn stored_for(device_id: &DeviceId) -> Self {
        CredentialStrategy::Stored {
            client_id: device_id.to_string(),
        }
    }
}

/// Provider-assigned id of a sent message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callbacks a provider fires for one device, one method per event
#[async_trait]
pub trait ProviderEvents: Send + Sync {
    /// A QR-style payload the user must scan
    async fn credential_challenge(&self, payload: String);

    async fn authenticated(&self);

    /// The device is live under `identity`
    async fn ready(&self, identity: Identity, metadata: serde_json::Value);

    async fn auth_failure(&self, reason: String);

    async fn disconnected(&self, reason: String);

    /// Inbound message; `from` is the raw provider sender address
    async fn message(&self, from: String, body: String);
}

/// Live provider session for one device
#[async_trait]
pub trait ProviderConnection: Send + Sync {
    async fn send(&self, to: &Identity, text: &str) -> Result<MessageId>;

    async fn logout(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Provider-side liveness (browser page still open)
    fn is_live(&self) -> bool;

    /// Whether `destroy` has run
    fn is_destroyed(&self) -> bool;
}

/// Factory for provider connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection and complete the initial handshake.
    ///
    /// Returns once the provider accepted the device; further progress
    /// (challenge, auth, ready) arrives through `events`.
    async fn connect(
        &self,
        device_id: &DeviceId,
        strategy: CredentialStrategy,
        events: Arc<dyn ProviderEvents>,
    ) -> Result<Arc<dyn ProviderConnection>>;
}

/// Send on behalf of a device; implemented by the session table
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_from(&self, device_id: &DeviceId, to: &Identity, text: &str) -> Result<MessageId>;

    /// Whether `device_id` currently holds a usable connection
    fn can_send(&self, device_id: &DeviceId) -> bool;
}
