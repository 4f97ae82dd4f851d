//! Core message and conversation types shared by every component.
//!
//! A [`Message`] is the store-side representation of one timeline entry.  It
//! is created either locally (as `Pending`, carrying a fresh correlation ID
//! until the transport confirms it) or externally (already `Sent`, carrying a
//! server-assigned ID and never a correlation ID).  [`WireMessage`] is the
//! boundary schema used by the transport; its field names and ISO-8601
//! timestamps match the delivery service's JSON.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Maximum length of a message body, in characters.
pub const MAX_TEXT_LEN: usize = 500;

/// Identifies one conversation: two participants scoped to a single job.
///
/// Participants are normalized into lexicographic order on construction so
/// that `(a, b)` and `(b, a)` name the same conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub job_id: String,
    pub participant_a: String,
    pub participant_b: String,
}

impl ConversationKey {
    pub fn new(
        job_id: impl Into<String>,
        participant_a: impl Into<String>,
        participant_b: impl Into<String>,
    ) -> Self {
        let (mut a, mut b) = (participant_a.into(), participant_b.into());
        if b < a {
            std::mem::swap(&mut a, &mut b);
        }
        Self {
            job_id: job_id.into(),
            participant_a: a,
            participant_b: b,
        }
    }

    /// Canonical string form used as the transport-level conversation ID.
    pub fn conversation_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.job_id, self.participant_a, self.participant_b
        )
    }

    /// The participant on the other side of the conversation from `user_id`.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.participant_a == user_id {
            &self.participant_b
        } else {
            &self.participant_a
        }
    }
}

/// Delivery state of a timeline entry.
///
/// Transitions: `Pending -> Sent` (confirmation or push echo) and
/// `Pending -> Failed` (transport failure).  Externally originated messages
/// are created directly as `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
}

/// One entry in a conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned ID; `None` until the send is confirmed.
    pub id: Option<String>,
    /// Client-generated ID linking a local send to its outcome; never set on
    /// messages that originated elsewhere.
    pub correlation_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Whether the receiver has read the message.  Monotonic: flips to true
    /// and never back.
    pub read: bool,
    pub delivery: DeliveryState,
}

impl Message {
    /// A confirmed message as delivered by the transport (push or history).
    pub fn from_wire(wire: WireMessage) -> Self {
        Self {
            id: Some(wire.id),
            correlation_id: None,
            conversation_id: wire.conversation_id,
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            text: wire.text,
            created_at: wire.created_at,
            read: wire.read_flag,
            delivery: DeliveryState::Sent,
        }
    }

    /// A confirmed message linked back to the local pending entry it settles.
    pub fn confirmed(wire: WireMessage, correlation_id: String) -> Self {
        let mut message = Self::from_wire(wire);
        message.correlation_id = Some(correlation_id);
        message
    }

    /// Sort key for the timeline: `created_at` ascending with a lexicographic
    /// ID tie-break.  Pending entries have no server ID yet and tie-break on
    /// their correlation ID instead.
    pub fn timeline_key(&self) -> (DateTime<Utc>, &str) {
        let tie = self
            .id
            .as_deref()
            .or(self.correlation_id.as_deref())
            .unwrap_or("");
        (self.created_at, tie)
    }
}

/// A message as it crosses the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub read_flag: bool,
}

/// Payload handed to the transport for an outgoing send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub correlation_id: String,
}

/// Generate a fresh correlation ID: 128 random bits, hex-encoded.
pub fn new_correlation_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
