//! Conversation scheduler - periodic outbound traffic per device
//!
//! At most one job per device. A job cycles through a fixed set of peer
//! identities, sending catalog messages in order and debiting the sender
//! for every successful send. Each job runs on its own task and stops when
//! its token is cancelled or the sender's balance runs out.

use crate::catalog::SharedCatalog;
use crate::config::{Config, DelayRange};
use crate::events::{EventBus, SessionEvent};
use crate::identity::{DeviceId, Identity};
use crate::ledger::CreditLedger;
use crate::registry::ConnectionRegistry;
use crate::transport::MessageSender;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-device conversation state
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationJob {
    pub owner_device: DeviceId,
    pub owner_identity: Identity,
    pub targets: Vec<Identity>,
    pub cursor_message: usize,
    pub cursor_target: usize,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

impl ConversationJob {
    pub fn new(owner_device: DeviceId, owner_identity: Identity, targets: Vec<Identity>) -> Self {
        Self {
            owner_device,
            owner_identity,
            targets,
            cursor_message: 0,
            cursor_target: 0,
            active: true,
            started_at: Utc::now(),
        }
    }

    /// Round-robin over the targets
    pub fn next_target(&mut self) -> Option<Identity> {
        if self.targets.is_empty() {
            return None;
        }
        let target = self.targets[self.cursor_target % self.targets.len()].clone();
        self.cursor_target = (self.cursor_target + 1) % self.targets.len();
        Some(target)
    }
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started { targets: Vec<Identity> },
    AlreadyRunning,
    InsufficientBalance,
    NoEligiblePeers,
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

/// Snapshot of a running job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub device_id: DeviceId,
    pub identity: Identity,
    pub targets: Vec<Identity>,
    pub cursor_message: usize,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

struct JobHandle {
    job: Arc<Mutex<ConversationJob>>,
    token: CancellationToken,
}

enum Tick {
    Continue,
    Finished,
}

pub struct ConversationScheduler {
    tick_interval: DelayRange,
    send_delay: DelayRange,
    tick_cost_minutes: f64,
    low_balance_minutes: f64,
    max_targets: usize,
    ledger: Arc<CreditLedger>,
    registry: Arc<ConnectionRegistry>,
    catalog: Arc<SharedCatalog>,
    sender: Arc<dyn MessageSender>,
    bus: EventBus,
    jobs: Mutex<HashMap<DeviceId, JobHandle>>,
}

impl ConversationScheduler {
    pub fn new(
        config: &Config,
        ledger: Arc<CreditLedger>,
        registry: Arc<ConnectionRegistry>,
        catalog: Arc<SharedCatalog>,
        sender: Arc<dyn MessageSender>,
        bus: EventBus,
    ) -> Self {
        Self {
            tick_interval: config.tick_interval,
            send_delay: config.send_delay,
            tick_cost_minutes: config.tick_cost_minutes,
            low_balance_minutes: config.low_balance_minutes,
            max_targets: config.max_targets,
            ledger,
            registry,
            catalog,
            sender,
            bus,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<DeviceId, JobHandle>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a conversation job for `device_id` sending as `identity`.
    ///
    /// Targets are active, funded identities that are ready on some device,
    /// excluding the sender, chosen at random up to the configured cap.
    pub fn start(self: &Arc<Self>, device_id: &DeviceId, identity: &Identity) -> StartOutcome {
        if self.has_job(device_id) {
            debug!(device = %device_id, "Conversation job already running");
            return StartOutcome::AlreadyRunning;
        }

        if self.ledger.get_balance(identity) <= 0.0 {
            info!(device = %device_id, identity = %identity, "Not starting conversations: no balance");
            return StartOutcome::InsufficientBalance;
        }

        let ready = self.registry.ready_identities();
        let targets: Vec<Identity> = self
            .ledger
            .funded_accounts()
            .into_iter()
            .filter(|t| t != identity && ready.contains(t))
            .take(self.max_targets)
            .collect();

        if targets.is_empty() {
            info!(device = %device_id, identity = %identity, "Not starting conversations: no eligible peers");
            return StartOutcome::NoEligiblePeers;
        }

        let job = Arc::new(Mutex::new(ConversationJob::new(
            device_id.clone(),
            identity.clone(),
            targets.clone(),
        )));
        let token = CancellationToken::new();

        match self.jobs().entry(device_id.clone()) {
            Entry::Occupied(_) => return StartOutcome::AlreadyRunning,
            Entry::Vacant(slot) => {
                slot.insert(JobHandle {
                    job: Arc::clone(&job),
                    token: token.clone(),
                });
            }
        }

        self.ledger.set_active_conversation_delta(identity, 1);
        info!(
            device = %device_id,
            identity = %identity,
            targets = targets.len(),
            "Conversation job started"
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(job, token).await });

        StartOutcome::Started { targets }
    }

    /// Cancel and remove the device's job. Returns false when there was none.
    pub fn stop(&self, device_id: &DeviceId) -> bool {
        let Some(handle) = self.jobs().remove(device_id) else {
            return false;
        };

        handle.token.cancel();
        let identity = {
            let mut job = lock_job(&handle.job);
            job.active = false;
            job.owner_identity.clone()
        };
        self.ledger.set_active_conversation_delta(&identity, -1);
        info!(device = %device_id, identity = %identity, "Conversation job stopped");
        true
    }

    pub fn has_job(&self, device_id: &DeviceId) -> bool {
        self.jobs().contains_key(device_id)
    }

    /// Every running job, ordered by device id
    pub fn status(&self) -> Vec<JobStatus> {
        let jobs = self.jobs();
        let mut status: Vec<JobStatus> = jobs
            .values()
            .map(|handle| {
                let job = lock_job(&handle.job);
                JobStatus {
                    device_id: job.owner_device.clone(),
                    identity: job.owner_identity.clone(),
                    targets: job.targets.clone(),
                    cursor_message: job.cursor_message,
                    active: job.active,
                    started_at: job.started_at,
                }
            })
            .collect();
        status.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        status
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tick immediately, then after a freshly drawn interval each time
    async fn run(self: Arc<Self>, job: Arc<Mutex<ConversationJob>>, token: CancellationToken) {
        let device_id = lock_job(&job).owner_device.clone();

        loop {
            if let Tick::Finished = self.tick(&job, &token).await {
                break;
            }

            let wait = self.tick_interval.pick();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!(device = %device_id, "Conversation loop exited");
    }

    async fn tick(&self, job: &Arc<Mutex<ConversationJob>>, token: &CancellationToken) -> Tick {
        let (device_id, identity) = {
            let job = lock_job(job);
            if !job.active || token.is_cancelled() {
                return Tick::Finished;
            }
            (job.owner_device.clone(), job.owner_identity.clone())
        };

        let balance = self.ledger.get_balance(&identity);
        if balance <= 0.0 {
            info!(device = %device_id, identity = %identity, "Balance exhausted, stopping conversations");
            self.stop(&device_id);
            return Tick::Finished;
        }
        if balance <= self.low_balance_minutes {
            self.bus.publish(SessionEvent::LowBalance {
                device_id: device_id.clone(),
                identity: identity.clone(),
                balance_minutes: balance,
            });
        }

        let Some(target) = lock_job(job).next_target() else {
            return Tick::Finished;
        };

        if !self.registry.is_ready(&target) || !self.ledger.is_funded(&target) {
            debug!(device = %device_id, target = %target, "Skipping target: not ready or not funded");
            return Tick::Continue;
        }

        tokio::select! {
            _ = token.cancelled() => return Tick::Finished,
            _ = tokio::time::sleep(self.send_delay.pick()) => {}
        }

        // May load from disk, so resolve it before taking the job lock
        let catalog = self.catalog.get();
        let text = {
            let mut job = lock_job(job);
            if !job.active || token.is_cancelled() {
                return Tick::Finished;
            }
            let Some(text) = catalog.get(job.cursor_message).map(str::to_string) else {
                warn!(device = %device_id, "Message catalog is empty, nothing to send");
                return Tick::Continue;
            };
            job.cursor_message = (job.cursor_message + 1) % catalog.len();
            text
        };

        let sent = tokio::select! {
            _ = token.cancelled() => {
                debug!(device = %device_id, target = %target, "Job stopped while sending");
                return Tick::Finished;
            }
            sent = self.sender.send_from(&device_id, &target, &text) => sent,
        };

        match sent {
            Ok(message_id) => {
                self.ledger.debit(&identity, self.tick_cost_minutes);
                debug!(device = %device_id, target = %target, message_id = %message_id, "Conversation message sent");
            }
            Err(e) => {
                warn!(device = %device_id, target = %target, error = %e, "Conversation send failed");
            }
        }

        Tick::Continue
    }
}

fn lock_job(job: &Mutex<ConversationJob>) -> MutexGuard<'_, ConversationJob> {
    job.lock().unwrap_or_else(|p| p.into_inner())
}
