//! In-process provider that routes messages between its own devices
//!
//! Each provisioned device gets a fixed identity. Connecting plays back the
//! usual handshake (challenge, authenticated, ready) and sends are delivered
//! as inbound messages to whichever loopback device owns the target identity.

use super::{CredentialStrategy, MessageId, ProviderConnection, ProviderEvents, Transport};
use crate::error::{Error, Result};
use crate::identity::{DeviceId, Identity};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_HANDSHAKE_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Routes {
    /// Provisioned device -> identity
    identities: HashMap<DeviceId, Identity>,
    /// Identity -> callbacks of the device that is ready under it
    online: HashMap<Identity, Arc<dyn ProviderEvents>>,
    /// Device -> callbacks of its current connection
    attached: HashMap<DeviceId, Arc<dyn ProviderEvents>>,
}

/// Shared switchboard for loopback devices
#[derive(Clone)]
pub struct LoopbackNetwork {
    routes: Arc<Mutex<Routes>>,
    next_message: Arc<AtomicU64>,
    handshake_delay: Duration,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_handshake_delay(DEFAULT_HANDSHAKE_DELAY)
    }

    /// Delay before each handshake step is reported
    pub fn with_handshake_delay(handshake_delay: Duration) -> Self {
        Self {
            routes: Arc::new(Mutex::new(Routes::default())),
            next_message: Arc::new(AtomicU64::new(1)),
            handshake_delay,
        }
    }

    /// Register a device so it can connect as `identity`
    pub fn provision(&self, device_id: DeviceId, identity: Identity) {
        self.routes().identities.insert(device_id, identity);
    }

    /// Drop a device from the provider side, as if the phone went away
    pub async fn drop_device(&self, device_id: &DeviceId, reason: &str) {
        let events = {
            let mut routes = self.routes();
            let events = routes.attached.remove(device_id);
            if let Some(identity) = routes.identities.get(device_id).cloned() {
                routes.online.remove(&identity);
            }
            events
        };

        if let Some(events) = events {
            events.disconnected(reason.to_string()).await;
        }
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn connect(
        &self,
        device_id: &DeviceId,
        strategy: CredentialStrategy,
        events: Arc<dyn ProviderEvents>,
    ) -> Result<Arc<dyn ProviderConnection>> {
        let identity = self
            .routes()
            .identities
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("device {} is not provisioned", device_id)))?;

        self.routes()
            .attached
            .insert(device_id.clone(), Arc::clone(&events));

        let connection = Arc::new(LoopbackConnection {
            network: self.clone(),
            device_id: device_id.clone(),
            identity: identity.clone(),
            live: Arc::new(AtomicBool::new(true)),
            destroyed: AtomicBool::new(false),
        });

        debug!(device = %device_id, ?strategy, "Loopback connect");

        let network = self.clone();
        let device = device_id.clone();
        let live = Arc::clone(&connection.live);
        let delay = self.handshake_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events
                .credential_challenge(format!("loopback:{}:{}", device, identity))
                .await;
            tokio::time::sleep(delay).await;
            if !live.load(Ordering::SeqCst) {
                return;
            }
            events.authenticated().await;
            tokio::time::sleep(delay).await;
            if !live.load(Ordering::SeqCst) {
                return;
            }
            network
                .routes()
                .online
                .insert(identity.clone(), Arc::clone(&events));
            events
                .ready(identity, json!({ "platform": "loopback", "pushname": device.as_str() }))
                .await;
        });

        Ok(connection as Arc<dyn ProviderConnection>)
    }
}

struct LoopbackConnection {
    network: LoopbackNetwork,
    device_id: DeviceId,
    identity: Identity,
    live: Arc<AtomicBool>,
    destroyed: AtomicBool,
}

impl LoopbackConnection {
    fn detach(&self) {
        self.live.store(false, Ordering::SeqCst);
        let mut routes = self.network.routes();
        routes.online.remove(&self.identity);
        routes.attached.remove(&self.device_id);
    }
}

#[async_trait]
impl ProviderConnection for LoopbackConnection {
    async fn send(&self, to: &Identity, text: &str) -> Result<MessageId> {
        if self.is_destroyed() {
            return Err(Error::NotConnected(self.device_id.to_string()));
        }

        let peer = self
            .network
            .routes()
            .online
            .get(to)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no route to {}", to)))?;

        let id = self.network.next_message.fetch_add(1, Ordering::SeqCst);
        let from = self.identity.chat_id();
        let body = text.to_string();
        tokio::spawn(async move {
            peer.message(from, body).await;
        });

        Ok(MessageId(format!("loopback-{}", id)))
    }

    async fn logout(&self) -> Result<()> {
        info!(device = %self.device_id, "Loopback logout");
        self.detach();
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.detach();
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
