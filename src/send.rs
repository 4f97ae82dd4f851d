//! Optimistic send path: pending entry first, reconcile with the transport
//! outcome afterwards.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::engine::ConversationEvent;
use crate::logging;
use crate::message::{
    new_correlation_id, DeliveryState, Message, OutgoingMessage, MAX_TEXT_LEN,
};
use crate::store::SharedStore;
use crate::transport::{MessageTransport, TransportError};

/// Why a send did not produce a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Text was empty after trimming.  Nothing was stored or transmitted.
    EmptyText,
    /// Text exceeded [`MAX_TEXT_LEN`] characters.  Nothing was stored or
    /// transmitted.
    TooLong { len: usize },
    /// The transport rejected or failed the send.  `draft` is the original
    /// text, returned so the caller can restore it into the compose field.
    Delivery {
        draft: String,
        reason: TransportError,
    },
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::EmptyText => write!(f, "message text is empty"),
            SendError::TooLong { len } => {
                write!(f, "message text is {len} characters (max {MAX_TEXT_LEN})")
            }
            SendError::Delivery { reason, .. } => write!(f, "delivery failed: {reason}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Converts a compose action into an immediately visible pending entry and
/// reconciles it against the confirmed or failed outcome.
///
/// Concurrent sends are independent: each gets its own correlation ID and
/// there is no ordering constraint between them.
pub struct SendController {
    store: SharedStore,
    transport: Arc<dyn MessageTransport>,
    events: broadcast::Sender<ConversationEvent>,
    local_user_id: String,
    conversation_id: String,
}

impl SendController {
    pub(crate) fn new(
        store: SharedStore,
        transport: Arc<dyn MessageTransport>,
        events: broadcast::Sender<ConversationEvent>,
        local_user_id: String,
        conversation_id: String,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            local_user_id,
            conversation_id,
        }
    }

    /// Send `text` to `receiver_id`.
    ///
    /// Validation failures are rejected before any store mutation or
    /// transport call.  On transport failure the pending entry leaves the
    /// timeline and the draft comes back in the error.
    pub async fn send(&self, text: &str, receiver_id: &str) -> Result<Message, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::EmptyText);
        }
        let len = text.chars().count();
        if len > MAX_TEXT_LEN {
            return Err(SendError::TooLong { len });
        }

        let correlation_id = new_correlation_id();
        let pending = Message {
            id: None,
            correlation_id: Some(correlation_id.clone()),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.local_user_id.clone(),
            receiver_id: receiver_id.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            read: false,
            delivery: DeliveryState::Pending,
        };

        // Optimistic visibility: the pending entry lands before the transport
        // is involved.
        {
            let mut store = self.store.lock().await;
            store.insert_pending(pending.clone());
        }
        let _ = self.events.send(ConversationEvent::MessageAdded {
            message_id: None,
            correlation_id: Some(correlation_id.clone()),
            sender_id: pending.sender_id.clone(),
            text: pending.text.clone(),
            created_at: pending.created_at,
            delivery: DeliveryState::Pending,
        });
        crate::jlog!(
            "send: pending {} to {}",
            logging::msg_id(&correlation_id),
            logging::user_id(receiver_id)
        );

        let outgoing = OutgoingMessage {
            conversation_id: self.conversation_id.clone(),
            sender_id: self.local_user_id.clone(),
            receiver_id: receiver_id.to_string(),
            text: text.to_string(),
            correlation_id: correlation_id.clone(),
        };

        match self.transport.send_message(&outgoing).await {
            Ok(wire) => {
                let confirmed = Message::confirmed(wire, correlation_id.clone());
                let message_id = confirmed.id.clone().unwrap_or_default();
                {
                    let mut store = self.store.lock().await;
                    store.upsert(confirmed.clone());
                }
                crate::jlog!(
                    "send: confirmed {} as {}",
                    logging::msg_id(&correlation_id),
                    logging::msg_id(&message_id)
                );
                let _ = self.events.send(ConversationEvent::SendConfirmed {
                    correlation_id,
                    message_id,
                });
                Ok(confirmed)
            }
            Err(reason) => {
                // A failed send is not shown as a message; the draft goes
                // back to the caller instead.
                let draft = {
                    let mut store = self.store.lock().await;
                    store.mark_failed(&correlation_id);
                    store.remove(&correlation_id).map(|m| m.text)
                }
                .unwrap_or_else(|| text.to_string());
                crate::jlog!(
                    "send: failed {} ({})",
                    logging::msg_id(&correlation_id),
                    reason
                );
                let _ = self.events.send(ConversationEvent::SendFailed {
                    correlation_id,
                    draft: draft.clone(),
                    reason: reason.to_string(),
                });
                Err(SendError::Delivery { draft, reason })
            }
        }
    }
}
