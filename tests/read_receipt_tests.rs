//! Integration tests for read-receipt propagation: debounce coalescing,
//! idempotence, the viewing gate, and silent retry after a failed ack.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::time::sleep;

use jobchat::engine::{ConversationEngine, EngineConfig};
use jobchat::identity::SessionIdentity;
use jobchat::message::{ConversationKey, OutgoingMessage, WireMessage};
use jobchat::transport::{MessageTransport, Subscription, SubscriptionEvent, TransportError};

/// Minimal transport: instant sends, one capturable subscription, countable
/// and optionally failing mark-read.
#[derive(Default)]
struct AckCountingTransport {
    history: Mutex<Vec<WireMessage>>,
    mark_read_calls: AtomicUsize,
    mark_read_fail: AtomicBool,
    push_tx: Mutex<Option<mpsc::Sender<SubscriptionEvent>>>,
}

impl AckCountingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acks(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }

    async fn push_message(&self, wire: WireMessage) {
        let tx = self.push_tx.lock().unwrap().clone();
        tx.expect("no live subscription")
            .send(SubscriptionEvent::MessageCreated(wire))
            .await
            .expect("subscriber gone");
    }
}

#[async_trait]
impl MessageTransport for AckCountingTransport {
    async fn fetch_history(
        &self,
        _conversation_id: &str,
    ) -> Result<Vec<WireMessage>, TransportError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn send_message(
        &self,
        outgoing: &OutgoingMessage,
    ) -> Result<WireMessage, TransportError> {
        Ok(WireMessage {
            id: format!("srv-{}", outgoing.correlation_id),
            conversation_id: outgoing.conversation_id.clone(),
            sender_id: outgoing.sender_id.clone(),
            receiver_id: outgoing.receiver_id.clone(),
            text: outgoing.text.clone(),
            created_at: Utc::now(),
            read_flag: false,
        })
    }

    async fn subscribe(&self, _conversation_id: &str) -> Result<Subscription, TransportError> {
        let (tx, subscription) = Subscription::channel();
        *self.push_tx.lock().unwrap() = Some(tx);
        Ok(subscription)
    }

    async fn mark_read(
        &self,
        _conversation_id: &str,
        _user_id: &str,
    ) -> Result<(), TransportError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        if self.mark_read_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Network("ack failed".to_string()));
        }
        Ok(())
    }
}

fn at_ms(ms: i64) -> DateTime<Utc> {
    let base = Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap();
    base + chrono::Duration::milliseconds(ms)
}

fn incoming(id: &str, ms: i64) -> WireMessage {
    WireMessage {
        id: id.to_string(),
        conversation_id: "job-1:alice:bob".to_string(),
        sender_id: "bob".to_string(),
        receiver_id: "alice".to_string(),
        text: format!("message {id}"),
        created_at: at_ms(ms),
        read_flag: false,
    }
}

async fn open_engine(transport: &Arc<AckCountingTransport>) -> ConversationEngine {
    let identity = SessionIdentity::new("alice");
    let dyn_transport: Arc<dyn MessageTransport> = transport.clone();
    let config = EngineConfig {
        read_debounce: Duration::from_millis(80),
        ..EngineConfig::default()
    };
    let engine = ConversationEngine::open_with_config(
        dyn_transport,
        &identity,
        ConversationKey::new("job-1", "alice", "bob"),
        config,
    )
    .await;
    sleep(Duration::from_millis(30)).await; // let the subscription attach
    engine
}

#[tokio::test]
async fn burst_of_arrivals_collapses_into_one_ack() {
    let transport = AckCountingTransport::new();
    let engine = open_engine(&transport).await;

    transport.push_message(incoming("m1", 0)).await;
    sleep(Duration::from_millis(10)).await;
    transport.push_message(incoming("m2", 10)).await;
    sleep(Duration::from_millis(10)).await;
    transport.push_message(incoming("m3", 20)).await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.acks(), 1);
    assert!(engine.messages().await.iter().all(|m| m.read));
}

#[tokio::test]
async fn no_ack_when_nothing_is_unread() {
    let transport = AckCountingTransport::new();
    let engine = open_engine(&transport).await;

    // Own sends never count as unread for the sender.
    engine.send("hello", "bob").await.unwrap();
    // An arrival the server already marked read needs no ack either.
    let mut already_read = incoming("m1", 50);
    already_read.read_flag = true;
    transport.push_message(already_read).await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.acks(), 0);
}

#[tokio::test]
async fn unread_history_is_acked_once_on_open() {
    let transport = AckCountingTransport::new();
    *transport.history.lock().unwrap() = vec![incoming("m1", 0), incoming("m2", 10)];

    let engine = open_engine(&transport).await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.acks(), 1);
    assert!(engine.messages().await.iter().all(|m| m.read));
}

#[tokio::test]
async fn viewing_gate_defers_acks_until_focus_returns() {
    let transport = AckCountingTransport::new();
    let engine = open_engine(&transport).await;

    engine.set_viewing(false);
    transport.push_message(incoming("m1", 0)).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.acks(), 0);
    assert!(!engine.messages().await[0].read);

    engine.set_viewing(true);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.acks(), 1);
    assert!(engine.messages().await[0].read);
}

#[tokio::test]
async fn failed_ack_keeps_messages_unread_and_retries() {
    let transport = AckCountingTransport::new();
    let engine = open_engine(&transport).await;

    transport.mark_read_fail.store(true, Ordering::SeqCst);
    transport.push_message(incoming("m1", 0)).await;
    sleep(Duration::from_millis(300)).await;

    // The ack was attempted but nothing flipped locally.
    assert_eq!(transport.acks(), 1);
    assert!(!engine.messages().await[0].read);

    // The next arrival retries and settles both.
    transport.mark_read_fail.store(false, Ordering::SeqCst);
    transport.push_message(incoming("m2", 10)).await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.acks(), 2);
    assert!(engine.messages().await.iter().all(|m| m.read));
}
