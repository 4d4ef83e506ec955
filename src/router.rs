//! Inbound message router - auto-replies between fleet identities
//!
//! A message from one ready, funded identity to another gets a random
//! catalog reply after a short delay. Independent of conversation jobs.

use crate::catalog::SharedCatalog;
use crate::config::{Config, DelayRange};
use crate::identity::{DeviceId, Identity};
use crate::ledger::CreditLedger;
use crate::registry::ConnectionRegistry;
use crate::transport::{MessageId, MessageSender};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why an inbound message got no reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Group, broadcast, or malformed sender
    UnroutableSender,
    /// Receiving device has no ready identity
    UnknownReceiver,
    /// Sender and receiver are the same identity
    Echo,
    PeerNotReady,
    Unfunded,
    ReceiverOffline,
    EmptyCatalog,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Replied(MessageId),
    Discarded(DiscardReason),
    Failed,
}

pub struct IncomingRouter {
    send_delay: DelayRange,
    reply_cost_minutes: f64,
    ledger: Arc<CreditLedger>,
    registry: Arc<ConnectionRegistry>,
    catalog: Arc<SharedCatalog>,
    sender: Arc<dyn MessageSender>,
}

impl IncomingRouter {
    pub fn new(
        config: &Config,
        ledger: Arc<CreditLedger>,
        registry: Arc<ConnectionRegistry>,
        catalog: Arc<SharedCatalog>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            send_delay: config.send_delay,
            reply_cost_minutes: config.tick_cost_minutes,
            ledger,
            registry,
            catalog,
            sender,
        }
    }

    /// Handle a message `from` (raw provider address) received on `receiver`
    pub async fn handle(&self, receiver: &DeviceId, from: &str, _body: &str) -> RouteOutcome {
        let Some(sender_identity) = Identity::from_sender(from) else {
            return RouteOutcome::Discarded(DiscardReason::UnroutableSender);
        };
        let Some(receiver_identity) = self.registry.identity_of(receiver) else {
            return RouteOutcome::Discarded(DiscardReason::UnknownReceiver);
        };
        if sender_identity == receiver_identity {
            return RouteOutcome::Discarded(DiscardReason::Echo);
        }
        if !self.registry.is_ready(&sender_identity) {
            return RouteOutcome::Discarded(DiscardReason::PeerNotReady);
        }
        if !self.ledger.is_funded(&sender_identity) || !self.ledger.is_funded(&receiver_identity) {
            return RouteOutcome::Discarded(DiscardReason::Unfunded);
        }
        if !self.sender.can_send(receiver) {
            return RouteOutcome::Discarded(DiscardReason::ReceiverOffline);
        }

        let Some(reply) = self.catalog.get().random().map(str::to_string) else {
            warn!(device = %receiver, "Message catalog is empty, not replying");
            return RouteOutcome::Discarded(DiscardReason::EmptyCatalog);
        };

        debug!(device = %receiver, from = %sender_identity, "Scheduling auto-reply");
        tokio::time::sleep(self.send_delay.pick()).await;

        match self.sender.send_from(receiver, &sender_identity, &reply).await {
            Ok(message_id) => {
                self.ledger.debit(&receiver_identity, self.reply_cost_minutes);
                info!(device = %receiver, to = %sender_identity, message_id = %message_id, "Auto-reply sent");
                RouteOutcome::Replied(message_id)
            }
            Err(e) => {
                warn!(device = %receiver, to = %sender_identity, error = %e, "Auto-reply failed");
                RouteOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MessageCatalog;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn id(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    struct StubSender {
        connected: bool,
        fail: bool,
        sent: Mutex<Vec<(DeviceId, Identity)>>,
    }

    #[async_trait]
    impl MessageSender for StubSender {
        async fn send_from(&self, device_id: &DeviceId, to: &Identity, _text: &str) -> Result<MessageId> {
            if self.fail {
                return Err(Error::NotConnected(device_id.to_string()));
            }
            self.sent.lock().unwrap().push((device_id.clone(), to.clone()));
            Ok(MessageId("reply-1".into()))
        }

        fn can_send(&self, _device_id: &DeviceId) -> bool {
            self.connected
        }
    }

    struct Fixture {
        router: IncomingRouter,
        ledger: Arc<CreditLedger>,
        registry: Arc<ConnectionRegistry>,
        sender: Arc<StubSender>,
        _temp_dir: TempDir,
    }

    fn fixture(connected: bool, fail: bool, messages: Vec<String>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::for_test(temp_dir.path());
        let ledger = Arc::new(CreditLedger::in_memory(0.5).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let sender = Arc::new(StubSender {
            connected,
            fail,
            sent: Mutex::new(Vec::new()),
        });
        let router = IncomingRouter::new(
            &config,
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::new(SharedCatalog::preloaded(MessageCatalog::new(messages))),
            Arc::clone(&sender) as Arc<dyn MessageSender>,
        );

        registry.mark_ready(&DeviceId::from("a"), id("5511900000001"));
        registry.mark_ready(&DeviceId::from("b"), id("5511900000002"));
        ledger.credit(&id("5511900000001"), 0.5);
        ledger.credit(&id("5511900000002"), 0.5);

        Fixture {
            router,
            ledger,
            registry,
            sender,
            _temp_dir: temp_dir,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(true, false, vec!["oi".into()])
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_debits_receiver() {
        let f = default_fixture();
        let outcome = f
            .router
            .handle(&DeviceId::from("b"), "5511900000001@c.us", "hello")
            .await;

        assert_eq!(outcome, RouteOutcome::Replied(MessageId("reply-1".into())));
        assert_eq!(
            *f.sender.sent.lock().unwrap(),
            vec![(DeviceId::from("b"), id("5511900000001"))]
        );
        let receiver_balance = f.ledger.get_balance(&id("5511900000002"));
        assert!((receiver_balance - (0.5 - 1.0 / 60.0)).abs() < 1e-9);
        assert_eq!(f.ledger.get_balance(&id("5511900000001")), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_discarded() {
        let f = default_fixture();
        let outcome = f
            .router
            .handle(&DeviceId::from("a"), "5511900000001@c.us", "hello")
            .await;
        assert_eq!(outcome, RouteOutcome::Discarded(DiscardReason::Echo));
        assert!(f.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_and_status_discarded() {
        let f = default_fixture();
        let receiver = DeviceId::from("b");
        assert_eq!(
            f.router.handle(&receiver, "status@broadcast", "x").await,
            RouteOutcome::Discarded(DiscardReason::UnroutableSender)
        );
        assert_eq!(
            f.router.handle(&receiver, "120363000000@g.us", "x").await,
            RouteOutcome::Discarded(DiscardReason::UnroutableSender)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_receiver_and_stranger() {
        let f = default_fixture();
        assert_eq!(
            f.router
                .handle(&DeviceId::from("zzz"), "5511900000001@c.us", "x")
                .await,
            RouteOutcome::Discarded(DiscardReason::UnknownReceiver)
        );
        assert_eq!(
            f.router
                .handle(&DeviceId::from("b"), "5511977777777@c.us", "x")
                .await,
            RouteOutcome::Discarded(DiscardReason::PeerNotReady)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfunded_discarded() {
        let f = default_fixture();
        f.ledger.debit(&id("5511900000002"), 1.0);
        assert_eq!(
            f.router
                .handle(&DeviceId::from("b"), "5511900000001@c.us", "x")
                .await,
            RouteOutcome::Discarded(DiscardReason::Unfunded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_receiver_discarded() {
        let f = fixture(false, false, vec!["oi".into()]);
        assert_eq!(
            f.router
                .handle(&DeviceId::from("b"), "5511900000001@c.us", "x")
                .await,
            RouteOutcome::Discarded(DiscardReason::ReceiverOffline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_catalog_discarded() {
        let f = fixture(true, false, vec![]);
        assert_eq!(
            f.router
                .handle(&DeviceId::from("b"), "5511900000001@c.us", "x")
                .await,
            RouteOutcome::Discarded(DiscardReason::EmptyCatalog)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reply_not_debited() {
        let f = fixture(true, true, vec!["oi".into()]);
        f.registry.mark_ready(&DeviceId::from("b"), id("5511900000002"));
        assert_eq!(
            f.router
                .handle(&DeviceId::from("b"), "5511900000001@c.us", "x")
                .await,
            RouteOutcome::Failed
        );
        assert_eq!(f.ledger.get_balance(&id("5511900000002")), 0.5);
    }
}
