//! Scripted provider for integration tests
//!
//! Connections never progress on their own; tests fire the provider
//! callbacks explicitly and inspect what was sent.

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_warmer::catalog::{MessageCatalog, SharedCatalog};
use fleet_warmer::config::Config;
use fleet_warmer::engine::Orchestrator;
use fleet_warmer::error::{Error, Result};
use fleet_warmer::identity::{DeviceId, Identity};
use fleet_warmer::ledger::CreditLedger;
use fleet_warmer::transport::{
    CredentialStrategy, MessageId, ProviderConnection, ProviderEvents, Transport,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub from_device: DeviceId,
    pub to: Identity,
    pub text: String,
}

#[derive(Default)]
pub struct FakeState {
    events: Mutex<HashMap<DeviceId, Vec<Arc<dyn ProviderEvents>>>>,
    connections: Mutex<HashMap<DeviceId, Vec<Arc<FakeConnection>>>>,
    sent: Mutex<Vec<SentMessage>>,
    next_id: AtomicUsize,
    attempts: AtomicUsize,
    pub hang_connect: AtomicBool,
    pub fail_sends: AtomicBool,
    pub busy_logout: AtomicBool,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    pub state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_events(&self, device: &DeviceId) -> Arc<dyn ProviderEvents> {
        self.state.events.lock().unwrap()[device]
            .last()
            .cloned()
            .unwrap()
    }

    /// Callbacks handed over on every connect of `device`, oldest first
    pub fn events_history(&self, device: &DeviceId) -> Vec<Arc<dyn ProviderEvents>> {
        self.state
            .events
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    /// Connections opened for `device`, oldest first
    pub fn connections(&self, device: &DeviceId) -> Vec<Arc<FakeConnection>> {
        self.state
            .connections
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self, device: &DeviceId) -> usize {
        self.connections(device).len()
    }

    /// Connect calls across all devices, including ones still hanging
    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().unwrap().clone()
    }

    pub async fn fire_challenge(&self, device: &DeviceId, payload: &str) {
        self.latest_events(device)
            .credential_challenge(payload.to_string())
            .await;
    }

    pub async fn fire_authenticated(&self, device: &DeviceId) {
        self.latest_events(device).authenticated().await;
    }

    pub async fn fire_ready(&self, device: &DeviceId, identity: &Identity) {
        self.latest_events(device)
            .ready(identity.clone(), json!({ "platform": "fake" }))
            .await;
    }

    pub async fn fire_auth_failure(&self, device: &DeviceId, reason: &str) {
        self.latest_events(device)
            .auth_failure(reason.to_string())
            .await;
    }

    pub async fn fire_disconnected(&self, device: &DeviceId, reason: &str) {
        self.latest_events(device)
            .disconnected(reason.to_string())
            .await;
    }

    pub async fn fire_message(&self, device: &DeviceId, from: &str, body: &str) {
        self.latest_events(device)
            .message(from.to_string(), body.to_string())
            .await;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        device_id: &DeviceId,
        _strategy: CredentialStrategy,
        events: Arc<dyn ProviderEvents>,
    ) -> Result<Arc<dyn ProviderConnection>> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        self.state
            .events
            .lock()
            .unwrap()
            .entry(device_id.clone())
            .or_default()
            .push(events);

        let connection = Arc::new(FakeConnection {
            device_id: device_id.clone(),
            state: Arc::clone(&self.state),
            logged_out: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        self.state
            .connections
            .lock()
            .unwrap()
            .entry(device_id.clone())
            .or_default()
            .push(Arc::clone(&connection));

        Ok(connection as Arc<dyn ProviderConnection>)
    }
}

pub struct FakeConnection {
    device_id: DeviceId,
    state: Arc<FakeState>,
    pub logged_out: AtomicBool,
    pub destroyed: AtomicBool,
}

impl FakeConnection {
    pub fn was_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderConnection for FakeConnection {
    async fn send(&self, to: &Identity, text: &str) -> Result<MessageId> {
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("send rejected".to_string()));
        }
        self.state.sent.lock().unwrap().push(SentMessage {
            from_device: self.device_id.clone(),
            to: to.clone(),
            text: text.to_string(),
        });
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(MessageId(format!("fake-{}", id)))
    }

    async fn logout(&self) -> Result<()> {
        self.logged_out.store(true, Ordering::SeqCst);
        if self.state.busy_logout.load(Ordering::SeqCst) {
            return Err(Error::ResourceBusy("session files locked".to_string()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_live(&self) -> bool {
        !self.was_destroyed()
    }

    fn is_destroyed(&self) -> bool {
        self.was_destroyed()
    }
}

pub struct Harness {
    pub fleet: Orchestrator,
    pub transport: FakeTransport,
    pub ledger: Arc<CreditLedger>,
    pub config: Config,
    _temp_dir: TempDir,
}

pub fn harness(auto_start: bool) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::for_test(temp_dir.path());
    config.auto_start = auto_start;

    let ledger = Arc::new(CreditLedger::open(&config).unwrap());
    let catalog = Arc::new(SharedCatalog::preloaded(MessageCatalog::new(vec![
        "m1".to_string(),
        "m2".to_string(),
        "m3".to_string(),
    ])));
    let transport = FakeTransport::new();
    let fleet = Orchestrator::new(
        &config,
        Arc::new(transport.clone()),
        Arc::clone(&ledger),
        catalog,
    );

    Harness {
        fleet,
        transport,
        ledger,
        config,
        _temp_dir: temp_dir,
    }
}

pub fn id(raw: &str) -> Identity {
    Identity::parse(raw).unwrap()
}

impl Harness {
    /// Initialize `device` and drive it to ready as `number`
    pub async fn ready(&self, device: &str, number: &str) -> (DeviceId, Identity) {
        let device_id = DeviceId::from(device);
        let identity = id(number);
        self.fleet
            .initialize_session(&device_id, Some(identity.clone()), false)
            .await
            .unwrap();
        self.transport.fire_challenge(&device_id, "2@challenge").await;
        self.transport.fire_authenticated(&device_id).await;
        self.transport.fire_ready(&device_id, &identity).await;
        (device_id, identity)
    }
}
