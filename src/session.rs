//! Device session management
//!
//! Owns one provider connection per device, drives the connection state
//! machine from provider callbacks, and tears sessions down. The owned
//! conversation job is always stopped before the connection is released.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, SessionEvent};
use crate::identity::{DeviceId, Identity};
use crate::ledger::CreditLedger;
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::router::IncomingRouter;
use crate::scheduler::ConversationScheduler;
use crate::transport::{
    CredentialStrategy, MessageId, MessageSender, ProviderConnection, ProviderEvents, Transport,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One device's session
struct DeviceSession {
    state: ConnectionState,
    handle: Option<Arc<dyn ProviderConnection>>,
    last_challenge: Option<String>,
    account_hint: Option<Identity>,
    identity: Option<Identity>,
    /// Distinguishes callbacks of this connection from those of a replaced one
    generation: u64,
}

impl DeviceSession {
    fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_destroyed())
    }
}

/// Snapshot of a device session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    pub connected: bool,
    pub live: bool,
}

/// Result of an initialize request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// A usable connection already existed
    AlreadyConnected,
    /// Another initialize for this device is still handshaking
    InProgress,
    /// A fresh connection was opened
    Initialized,
}

/// Device id -> session; the only holder of provider handles
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<DeviceId, DeviceSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, DeviceSession>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn handle(&self, device_id: &DeviceId) -> Option<Arc<dyn ProviderConnection>> {
        self.lock().get(device_id).and_then(|s| s.handle.clone())
    }

    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.lock().get(device_id).is_some_and(DeviceSession::is_connected)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageSender for SessionTable {
    async fn send_from(&self, device_id: &DeviceId, to: &Identity, text: &str) -> Result<MessageId> {
        let handle = self
            .handle(device_id)
            .filter(|h| !h.is_destroyed())
            .ok_or_else(|| Error::NotConnected(device_id.to_string()))?;
        handle.send(to, text).await
    }

    fn can_send(&self, device_id: &DeviceId) -> bool {
        self.is_connected(device_id)
    }
}

/// Session lifecycle owner
pub struct SessionManager {
    handshake_timeout: Duration,
    auto_start: bool,
    transport: Arc<dyn Transport>,
    table: Arc<SessionTable>,
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<CreditLedger>,
    scheduler: Arc<ConversationScheduler>,
    router: Arc<IncomingRouter>,
    bus: EventBus,
    generation: AtomicU64,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        table: Arc<SessionTable>,
        registry: Arc<ConnectionRegistry>,
        ledger: Arc<CreditLedger>,
        scheduler: Arc<ConversationScheduler>,
        router: Arc<IncomingRouter>,
        bus: EventBus,
    ) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            auto_start: config.auto_start,
            transport,
            table,
            registry,
            ledger,
            scheduler,
            router,
            bus,
            generation: AtomicU64::new(0),
        }
    }

    /// Open a provider connection for `device_id`.
    ///
    /// Idempotent: an existing connection or an in-flight handshake is left
    /// alone unless `force` is set. Forced re-initialization and a session
    /// whose connection was destroyed both tear the old session (and its
    /// job) down before the replacement is opened.
    pub async fn initialize(
        self: &Arc<Self>,
        device_id: &DeviceId,
        account_hint: Option<Identity>,
        force: bool,
    ) -> Result<InitOutcome> {
        let replace = match self.table.lock().get(device_id) {
            Some(_) if force => true,
            Some(existing) => existing.handle.is_some() && !existing.is_connected(),
            None => false,
        };
        if replace {
            info!(device = %device_id, force, "Replacing existing session");
            self.teardown(device_id, "REINITIALIZE").await;
        }

        let generation = {
            let mut sessions = self.table.lock();
            if let Some(existing) = sessions.get(device_id) {
                if existing.is_connected() {
                    debug!(device = %device_id, "Session already connected");
                    return Ok(InitOutcome::AlreadyConnected);
                }
                if existing.handle.is_none() {
                    debug!(device = %device_id, "Session initialization already in progress");
                    return Ok(InitOutcome::InProgress);
                }
            }

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            sessions.insert(
                device_id.clone(),
                DeviceSession {
                    state: ConnectionState::Initializing,
                    handle: None,
                    last_challenge: None,
                    account_hint,
                    identity: None,
                    generation,
                },
            );
            generation
        };
        self.registry.set_state(device_id, ConnectionState::Initializing);

        info!(device = %device_id, "Initializing session");

        let events: Arc<dyn ProviderEvents> = Arc::new(DeviceEvents {
            device_id: device_id.clone(),
            generation,
            manager: Arc::downgrade(self),
        });
        let connect = self.transport.connect(
            device_id,
            CredentialStrategy::stored_for(device_id),
            events,
        );

        match tokio::time::timeout(self.handshake_timeout, connect).await {
            Ok(Ok(handle)) => {
                let stored = {
                    let mut sessions = self.table.lock();
                    match sessions.get_mut(device_id) {
                        Some(session) if session.generation == generation => {
                            session.handle = Some(Arc::clone(&handle));
                            true
                        }
                        _ => false,
                    }
                };

                if stored {
                    info!(device = %device_id, "Session handshake started");
                    Ok(InitOutcome::Initialized)
                } else {
                    // Disconnected or replaced while the handshake was running
                    warn!(device = %device_id, "Session removed during handshake, discarding connection");
                    release(device_id, handle).await;
                    Err(Error::NotConnected(device_id.to_string()))
                }
            }
            Ok(Err(e)) => {
                error!(device = %device_id, error = %e, "Failed to connect session");
                self.forget(device_id, generation);
                Err(e)
            }
            Err(_) => {
                error!(device = %device_id, timeout = ?self.handshake_timeout, "Session handshake timed out");
                self.forget(device_id, generation);
                Err(Error::HandshakeTimeout {
                    device: device_id.to_string(),
                    timeout: self.handshake_timeout,
                })
            }
        }
    }

    /// Stop the device's job, log out and destroy its connection.
    /// Always succeeds, even when no session existed.
    pub async fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        if !self.teardown(device_id, "LOGOUT").await {
            debug!(device = %device_id, "Disconnect requested for unknown session");
        }
        Ok(())
    }

    /// Optimistic liveness: a handle exists and has not been destroyed
    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.table.is_connected(device_id)
    }

    /// Last credential challenge payload, until the device becomes ready
    pub fn credential_challenge(&self, device_id: &DeviceId) -> Option<String> {
        self.table
            .lock()
            .get(device_id)
            .and_then(|s| s.last_challenge.clone())
    }

    /// Every known session, ordered by device id
    pub fn list_active_devices(&self) -> Vec<DeviceStatus> {
        let sessions = self.table.lock();
        let mut devices: Vec<DeviceStatus> = sessions
            .iter()
            .map(|(device_id, s)| DeviceStatus {
                device_id: device_id.clone(),
                state: s.state,
                identity: s.identity.clone().or_else(|| s.account_hint.clone()),
                connected: s.is_connected(),
                live: s.handle.as_ref().is_some_and(|h| h.is_live()),
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Job first, then registry and session, then the provider handle.
    /// Returns whether a session existed.
    async fn teardown(&self, device_id: &DeviceId, reason: &str) -> bool {
        self.scheduler.stop(device_id);

        let session = self.table.lock().remove(device_id);
        self.registry.remove(device_id);

        let Some(session) = session else {
            return false;
        };

        if let Some(handle) = session.handle {
            if let Err(e) = handle.logout().await {
                log_teardown_error(device_id, "logout", &e);
            }
            release(device_id, handle).await;
        }

        info!(device = %device_id, reason, "Session disconnected");
        self.bus.publish(SessionEvent::Disconnected {
            device_id: device_id.clone(),
            reason: reason.to_string(),
        });
        true
    }

    /// Drop a placeholder left by a failed handshake
    fn forget(&self, device_id: &DeviceId, generation: u64) {
        let mut sessions = self.table.lock();
        if sessions.get(device_id).is_some_and(|s| s.generation == generation) {
            sessions.remove(device_id);
            self.registry.remove(device_id);
        }
    }

    /// Apply `f` to the session if it still belongs to `generation`
    fn with_current<T>(
        &self,
        device_id: &DeviceId,
        generation: u64,
        f: impl FnOnce(&mut DeviceSession) -> T,
    ) -> Option<T> {
        let mut sessions = self.table.lock();
        match sessions.get_mut(device_id) {
            Some(session) if session.generation == generation => Some(f(session)),
            _ => {
                debug!(device = %device_id, generation, "Ignoring callback from stale connection");
                None
            }
        }
    }

    // ============================================================================
    // Provider callbacks
    // ============================================================================

    fn on_credential_challenge(&self, device_id: &DeviceId, generation: u64, payload: String) {
        let updated = self.with_current(device_id, generation, |s| {
            s.state = ConnectionState::AwaitingScan;
            s.last_challenge = Some(payload.clone());
        });
        if updated.is_none() {
            return;
        }

        self.registry.set_state(device_id, ConnectionState::AwaitingScan);
        info!(device = %device_id, "Credential challenge issued");
        self.bus.publish(SessionEvent::CredentialChallenge {
            device_id: device_id.clone(),
            payload,
        });
    }

    fn on_authenticated(&self, device_id: &DeviceId, generation: u64) {
        let updated = self.with_current(device_id, generation, |s| {
            s.state = ConnectionState::Authenticated;
        });
        if updated.is_none() {
            return;
        }

        self.registry.set_state(device_id, ConnectionState::Authenticated);
        info!(device = %device_id, "Session authenticated");
        self.bus.publish(SessionEvent::Authenticated {
            device_id: device_id.clone(),
        });
    }

    fn on_ready(
        &self,
        device_id: &DeviceId,
        generation: u64,
        identity: Identity,
        metadata: serde_json::Value,
    ) {
        let updated = self.with_current(device_id, generation, |s| {
            s.state = ConnectionState::Ready;
            s.last_challenge = None;
            s.identity = Some(identity.clone());
        });
        if updated.is_none() {
            return;
        }

        self.registry.mark_ready(device_id, identity.clone());
        if !self.ledger.touch(&identity) {
            warn!(device = %device_id, identity = %identity, "Account not recorded on ready");
        }

        info!(device = %device_id, identity = %identity, "Session ready");
        self.bus.publish(SessionEvent::Ready {
            device_id: device_id.clone(),
            identity,
            metadata,
        });

        if self.auto_start {
            self.auto_start_conversations(device_id);
        }
    }

    /// Start the new device, and every other ready device without a job,
    /// since a new peer can make a lone device eligible
    fn auto_start_conversations(&self, device_id: &DeviceId) {
        let mut candidates = self.registry.ready_devices();
        candidates.sort_by_key(|(d, _)| d != device_id);

        for (device, identity) in candidates {
            if self.scheduler.has_job(&device) {
                continue;
            }
            let outcome = self.scheduler.start(&device, &identity);
            debug!(device = %device, identity = %identity, ?outcome, "Auto-start");
        }
    }

    fn on_auth_failure(&self, device_id: &DeviceId, generation: u64, reason: String) {
        if self.with_current(device_id, generation, |_| ()).is_none() {
            return;
        }
        warn!(device = %device_id, reason = %reason, "Session authentication failed");
        self.bus.publish(SessionEvent::AuthFailed {
            device_id: device_id.clone(),
            reason,
        });
    }

    async fn on_disconnected(&self, device_id: &DeviceId, generation: u64, reason: String) {
        if self.with_current(device_id, generation, |_| ()).is_none() {
            return;
        }

        self.scheduler.stop(device_id);

        let session = {
            let mut sessions = self.table.lock();
            match sessions.get(device_id) {
                Some(s) if s.generation == generation => sessions.remove(device_id),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };
        self.registry.remove(device_id);

        if let Some(handle) = session.handle {
            release(device_id, handle).await;
        }

        warn!(device = %device_id, reason = %reason, "Session disconnected by provider");
        self.bus.publish(SessionEvent::Disconnected {
            device_id: device_id.clone(),
            reason,
        });
    }

    fn on_message(&self, device_id: &DeviceId, generation: u64, from: String, body: String) {
        if self.with_current(device_id, generation, |_| ()).is_none() {
            return;
        }

        let router = Arc::clone(&self.router);
        let device = device_id.clone();
        tokio::spawn(async move {
            let outcome = router.handle(&device, &from, &body).await;
            debug!(device = %device, from = %from, ?outcome, "Inbound message handled");
        });
    }
}

/// Destroy a handle, tolerating lock-style failures
async fn release(device_id: &DeviceId, handle: Arc<dyn ProviderConnection>) {
    if let Err(e) = handle.destroy().await {
        log_teardown_error(device_id, "destroy", &e);
    }
}

fn log_teardown_error(device_id: &DeviceId, step: &str, e: &Error) {
    if e.is_resource_busy() {
        warn!(device = %device_id, step, error = %e, "Resource busy during teardown, continuing");
    } else {
        error!(device = %device_id, step, error = %e, "Teardown step failed, continuing");
    }
}

/// Callback capability handed to the provider for one connection
struct DeviceEvents {
    device_id: DeviceId,
    generation: u64,
    manager: Weak<SessionManager>,
}

#[async_trait]
impl ProviderEvents for DeviceEvents {
    async fn credential_challenge(&self, payload: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_credential_challenge(&self.device_id, self.generation, payload);
        }
    }

    async fn authenticated(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_authenticated(&self.device_id, self.generation);
        }
    }

    async fn ready(&self, identity: Identity, metadata: serde_json::Value) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_ready(&self.device_id, self.generation, identity, metadata);
        }
    }

    async fn auth_failure(&self, reason: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_auth_failure(&self.device_id, self.generation, reason);
        }
    }

    async fn disconnected(&self, reason: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager
                .on_disconnected(&self.device_id, self.generation, reason)
                .await;
        }
    }

    async fn message(&self, from: String, body: String) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_message(&self.device_id, self.generation, from, body);
        }
    }
}
