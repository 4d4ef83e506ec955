//! Orchestrator - the command and query surface of the fleet
//!
//! Wires the session manager, scheduler, router and ledger together over a
//! single transport. Front ends (CLI, push gateway) only talk to this type.

use crate::catalog::SharedCatalog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, SessionEvent};
use crate::identity::{DeviceId, Identity};
use crate::ledger::{Account, AccountStatus, CreditLedger};
use crate::registry::ConnectionRegistry;
use crate::router::IncomingRouter;
use crate::scheduler::{ConversationScheduler, JobStatus, StartOutcome};
use crate::session::{DeviceStatus, InitOutcome, SessionManager, SessionTable};
use crate::transport::{MessageId, MessageSender, Transport};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Orchestrator {
    ledger: Arc<CreditLedger>,
    registry: Arc<ConnectionRegistry>,
    table: Arc<SessionTable>,
    scheduler: Arc<ConversationScheduler>,
    sessions: Arc<SessionManager>,
    bus: EventBus,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        ledger: Arc<CreditLedger>,
        catalog: Arc<SharedCatalog>,
    ) -> Self {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let table = Arc::new(SessionTable::new());
        let sender: Arc<dyn MessageSender> = table.clone();

        let scheduler = Arc::new(ConversationScheduler::new(
            config,
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&sender),
            bus.clone(),
        ));
        let router = Arc::new(IncomingRouter::new(
            config,
            Arc::clone(&ledger),
            Arc::clone(&registry),
            catalog,
            sender,
        ));
        let sessions = Arc::new(SessionManager::new(
            config,
            transport,
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            Arc::clone(&scheduler),
            router,
            bus.clone(),
        ));

        Self {
            ledger,
            registry,
            table,
            scheduler,
            sessions,
            bus,
        }
    }

    /// Session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    // ============================================================================
    // Commands
    // ============================================================================

    pub async fn initialize_session(
        &self,
        device_id: &DeviceId,
        account_hint: Option<Identity>,
        force: bool,
    ) -> Result<InitOutcome> {
        self.sessions.initialize(device_id, account_hint, force).await
    }

    pub async fn disconnect_session(&self, device_id: &DeviceId) -> Result<()> {
        self.sessions.disconnect(device_id).await
    }

    /// Start conversations for a ready device under its real identity.
    ///
    /// The identity is resolved from the device's Ready registry entry rather
    /// than taken from the caller; a device that is not ready is `NotConnected`.
    pub fn start_conversations(&self, device_id: &DeviceId) -> Result<StartOutcome> {
        let identity = self
            .registry
            .identity_of(device_id)
            .ok_or_else(|| Error::NotConnected(device_id.to_string()))?;
        Ok(self.scheduler.start(device_id, &identity))
    }

    /// Returns whether a job was running
    pub fn stop_conversations(&self, device_id: &DeviceId) -> bool {
        self.scheduler.stop(device_id)
    }

    /// Ok(false) when storage did not take the write
    pub fn add_credit(&self, identity: &Identity, minutes: f64) -> Result<bool> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(Error::InvalidAmount(minutes));
        }
        Ok(self.ledger.credit(identity, minutes))
    }

    /// Send `text` from whichever device is ready as `identity`
    pub async fn send_message(&self, identity: &Identity, to: &Identity, text: &str) -> Result<MessageId> {
        let device_id = self
            .registry
            .device_for(identity)
            .ok_or_else(|| Error::NotConnected(identity.to_string()))?;
        self.table.send_from(&device_id, to, text).await
    }

    pub fn set_status(&self, identity: &Identity, status: AccountStatus) -> bool {
        self.ledger.set_status(identity, status)
    }

    // ============================================================================
    // Queries
    // ============================================================================

    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.sessions.is_connected(device_id)
    }

    pub fn list_active_devices(&self) -> Vec<DeviceStatus> {
        self.sessions.list_active_devices()
    }

    pub fn credential_challenge(&self, device_id: &DeviceId) -> Option<String> {
        self.sessions.credential_challenge(device_id)
    }

    pub fn get_balance(&self, identity: &Identity) -> f64 {
        self.ledger.get_balance(identity)
    }

    pub fn account(&self, identity: &Identity) -> Result<Option<Account>> {
        self.ledger.account(identity)
    }

    pub fn funded_accounts(&self) -> Vec<Identity> {
        self.ledger.funded_accounts()
    }

    pub fn conversation_status(&self) -> Vec<JobStatus> {
        self.scheduler.status()
    }

    pub fn storage_healthy(&self) -> bool {
        self.ledger.is_healthy()
    }
}
