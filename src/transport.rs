//! The abstract delivery-service interface the engine consumes.
//!
//! The engine never talks to sockets, polling loops, or push services
//! directly; a concrete [`MessageTransport`] implementation owns all of that
//! and may silently drop subscription events across disconnects.  Closing the
//! gaps that result is the engine's job, not the transport's.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{OutgoingMessage, WireMessage};

/// Default bound for a subscription's event queue.  Messages are small and
/// arrive at bounded frequency, so the consumer always accepts and merges.
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The operation could not reach the delivery service.
    Network(String),
    /// The delivery service refused the operation.
    Rejected(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Network(reason) => write!(f, "network error: {reason}"),
            TransportError::Rejected(reason) => write!(f, "rejected by transport: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Connection lifecycle of a live subscription, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Events pushed over a subscription channel.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A message was accepted by the server for this conversation.  Includes
    /// echoes of the local user's own sends.
    MessageCreated(WireMessage),
    /// The underlying stream changed connection state.
    ConnectionChanged(ConnectionState),
}

/// A live event stream scoped to one conversation.
///
/// Dropping the subscription releases the underlying stream handle; the
/// transport sees the channel close and must stop delivering.
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::Receiver<SubscriptionEvent>,
}

impl Subscription {
    /// Build a subscription plus the sender half the transport feeds.
    pub fn channel() -> (mpsc::Sender<SubscriptionEvent>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (tx, Subscription { events: rx })
    }
}

/// Fetch/send/subscribe/mark-read operations provided by the delivery
/// service.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Full (or delta) ordered history for the conversation.
    async fn fetch_history(&self, conversation_id: &str)
        -> Result<Vec<WireMessage>, TransportError>;

    /// Deliver one outgoing message; resolves to the confirmed message with
    /// its server ID and timestamp, or an error.  A stalled send must
    /// eventually resolve under the transport's own contract.
    async fn send_message(&self, outgoing: &OutgoingMessage)
        -> Result<WireMessage, TransportError>;

    /// Open a live event stream for the conversation.
    async fn subscribe(&self, conversation_id: &str) -> Result<Subscription, TransportError>;

    /// Acknowledge that `user_id` has read the conversation.
    async fn mark_read(&self, conversation_id: &str, user_id: &str)
        -> Result<(), TransportError>;
}
