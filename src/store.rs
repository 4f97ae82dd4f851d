//! Authoritative ordered cache of one conversation's messages.
//!
//! The store is the single merge point for every mutation source: optimistic
//! sends, push events, reconciliation fetches, and read-state transitions.
//! It holds plain data and is shared as [`SharedStore`]; the surrounding
//! `tokio::sync::Mutex` is the serialized mutation path, so two merges racing
//! on the same ID cannot interleave.  No caller holds the lock across an
//! await.
//!
//! Entries are kept sorted at all times (ascending `created_at`, lexicographic
//! ID tie-break, stable), so [`ConversationStore::ordered`] is a pure read.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::message::{ConversationKey, DeliveryState, Message};

/// The one mutable shared resource per open conversation.
pub type SharedStore = Arc<Mutex<ConversationStore>>;

/// What [`ConversationStore::upsert`] did with an incoming confirmed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new entry was appended to the timeline.
    Inserted,
    /// A pending entry with a matching correlation ID was replaced in place.
    ConfirmedPending,
    /// An entry with this ID already existed and absorbed new state (read
    /// flag, correlation link, or a leftover pending twin was dropped).
    Merged,
    /// An identical entry already existed; nothing changed.
    Duplicate,
}

/// Ordered message cache for a single conversation.
#[derive(Debug)]
pub struct ConversationStore {
    key: ConversationKey,
    entries: Vec<Message>,
    /// Confirmed server IDs present in `entries`; the dedupe set.
    confirmed: HashSet<String>,
}

impl ConversationStore {
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
            confirmed: HashSet::new(),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The ordered timeline.  Failed entries linger here only between
    /// `mark_failed` and `remove`.
    pub fn ordered(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a confirmed message with this server ID is already stored.
    pub fn has_message(&self, id: &str) -> bool {
        self.confirmed.contains(id)
    }

    /// Merge a confirmed message into the timeline.
    ///
    /// Idempotent by server ID.  If the incoming message carries a
    /// correlation ID matching a pending entry, that entry is replaced rather
    /// than a new one appended.  If the push echo of a local send landed
    /// before its confirmation (same ID, no correlation ID on the wire), the
    /// later confirmation merges into the echo entry and drops the leftover
    /// pending twin, so any interleaving ends with exactly one entry.
    pub fn upsert(&mut self, incoming: Message) -> UpsertOutcome {
        let Some(id) = incoming.id.clone() else {
            // Confirmed messages always carry a server ID; nothing to merge.
            return UpsertOutcome::Duplicate;
        };

        if self.confirmed.contains(&id) {
            let mut changed = false;
            if let Some(existing) = self
                .entries
                .iter_mut()
                .find(|m| m.id.as_deref() == Some(id.as_str()))
            {
                // Read flag is monotonic: absorb true, never revert.
                if incoming.read && !existing.read {
                    existing.read = true;
                    changed = true;
                }
                if existing.correlation_id.is_none() && incoming.correlation_id.is_some() {
                    existing.correlation_id = incoming.correlation_id.clone();
                    changed = true;
                }
            }
            // The confirmation may arrive after its push echo already created
            // the entry above; discard the pending twin it refers to.
            if let Some(cid) = incoming.correlation_id.as_deref() {
                let before = self.entries.len();
                self.entries
                    .retain(|m| !(m.id.is_none() && m.correlation_id.as_deref() == Some(cid)));
                if self.entries.len() != before {
                    changed = true;
                }
            }
            return if changed {
                UpsertOutcome::Merged
            } else {
                UpsertOutcome::Duplicate
            };
        }

        if let Some(cid) = incoming.correlation_id.as_deref() {
            if let Some(pos) = self
                .entries
                .iter()
                .position(|m| m.id.is_none() && m.correlation_id.as_deref() == Some(cid))
            {
                let read = self.entries[pos].read || incoming.read;
                let mut replacement = incoming;
                replacement.read = read;
                self.entries[pos] = replacement;
                self.confirmed.insert(id);
                self.resort();
                return UpsertOutcome::ConfirmedPending;
            }
        }

        self.entries.push(incoming);
        self.confirmed.insert(id);
        self.resort();
        UpsertOutcome::Inserted
    }

    /// Insert a locally created pending message (optimistic visibility).
    ///
    /// At most one pending entry per correlation ID; a duplicate insert is
    /// rejected.
    pub fn insert_pending(&mut self, message: Message) -> bool {
        let Some(cid) = message.correlation_id.as_deref() else {
            return false;
        };
        if self
            .entries
            .iter()
            .any(|m| m.correlation_id.as_deref() == Some(cid))
        {
            return false;
        }
        self.entries.push(message);
        self.resort();
        true
    }

    /// Transition a pending entry to Failed.  Entries that already have a
    /// confirmed ID are never altered.
    pub fn mark_failed(&mut self, correlation_id: &str) -> bool {
        for entry in &mut self.entries {
            if entry.id.is_none()
                && entry.correlation_id.as_deref() == Some(correlation_id)
                && entry.delivery == DeliveryState::Pending
            {
                entry.delivery = DeliveryState::Failed;
                return true;
            }
        }
        false
    }

    /// Discard a Failed entry, returning it so the caller can restore the
    /// draft text.  Confirmed entries are untouchable through this path.
    pub fn remove(&mut self, correlation_id: &str) -> Option<Message> {
        let pos = self.entries.iter().position(|m| {
            m.id.is_none()
                && m.correlation_id.as_deref() == Some(correlation_id)
                && m.delivery == DeliveryState::Failed
        })?;
        Some(self.entries.remove(pos))
    }

    /// Number of messages addressed to `user_id` not yet marked read.
    pub fn unread_count_for(&self, user_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|m| m.receiver_id == user_id && !m.read)
            .count()
    }

    /// Optimistically flip every unread message addressed to `user_id` to
    /// read.  Returns how many flipped.
    pub fn mark_read_local(&mut self, user_id: &str) -> usize {
        let mut flipped = 0;
        for entry in &mut self.entries {
            if entry.receiver_id == user_id && !entry.read {
                entry.read = true;
                flipped += 1;
            }
        }
        flipped
    }

    fn resort(&mut self) {
        self.entries
            .sort_by(|a, b| a.timeline_key().cmp(&b.timeline_key()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{new_correlation_id, WireMessage};
    use chrono::{DateTime, TimeZone, Utc};

    fn key() -> ConversationKey {
        ConversationKey::new("job-1", "alice", "bob")
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, secs).unwrap()
    }

    fn wire(id: &str, sender: &str, receiver: &str, text: &str, secs: u32) -> WireMessage {
        WireMessage {
            id: id.to_string(),
            conversation_id: key().conversation_id(),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            text: text.to_string(),
            created_at: at(secs),
            read_flag: false,
        }
    }

    fn pending(cid: &str, text: &str, secs: u32) -> Message {
        Message {
            id: None,
            correlation_id: Some(cid.to_string()),
            conversation_id: key().conversation_id(),
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            text: text.to_string(),
            created_at: at(secs),
            read: false,
            delivery: DeliveryState::Pending,
        }
    }

    #[test]
    fn test_upsert_is_idempotent_by_id() {
        let mut store = ConversationStore::new(key());
        let m = Message::from_wire(wire("m1", "bob", "alice", "hey", 0));

        assert_eq!(store.upsert(m.clone()), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(m), UpsertOutcome::Duplicate);
        assert_eq!(store.len(), 1);
        assert!(store.has_message("m1"));
    }

    #[test]
    fn test_confirmation_replaces_pending_in_place() {
        let mut store = ConversationStore::new(key());
        let cid = new_correlation_id();
        assert!(store.insert_pending(pending(&cid, "Hi", 0)));
        assert_eq!(store.ordered()[0].delivery, DeliveryState::Pending);

        // Server assigns an ID and a slightly later timestamp.
        let confirmed = Message::confirmed(wire("m1", "alice", "bob", "Hi", 1), cid.clone());
        assert_eq!(store.upsert(confirmed), UpsertOutcome::ConfirmedPending);

        assert_eq!(store.len(), 1);
        let entry = &store.ordered()[0];
        assert_eq!(entry.id.as_deref(), Some("m1"));
        assert_eq!(entry.delivery, DeliveryState::Sent);
        assert_eq!(entry.created_at, at(1));
    }

    #[test]
    fn test_duplicate_pending_insert_rejected() {
        let mut store = ConversationStore::new(key());
        let cid = new_correlation_id();
        assert!(store.insert_pending(pending(&cid, "once", 0)));
        assert!(!store.insert_pending(pending(&cid, "twice", 1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_echo_then_confirmation_leaves_one_entry() {
        let mut store = ConversationStore::new(key());
        let cid = new_correlation_id();
        store.insert_pending(pending(&cid, "Hi", 0));

        // The push echo of our own send arrives first; the wire never carries
        // a correlation ID, so it lands as a separate entry.
        let echo = Message::from_wire(wire("m1", "alice", "bob", "Hi", 1));
        assert_eq!(store.upsert(echo), UpsertOutcome::Inserted);
        assert_eq!(store.len(), 2);

        // The confirmation then links the ID to the correlation ID and the
        // pending twin is dropped.
        let confirmed = Message::confirmed(wire("m1", "alice", "bob", "Hi", 1), cid);
        assert_eq!(store.upsert(confirmed), UpsertOutcome::Merged);
        assert_eq!(store.len(), 1);
        assert_eq!(store.ordered()[0].id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_confirmation_then_echo_leaves_one_entry() {
        let mut store = ConversationStore::new(key());
        let cid = new_correlation_id();
        store.insert_pending(pending(&cid, "Hi", 0));

        let confirmed = Message::confirmed(wire("m1", "alice", "bob", "Hi", 1), cid);
        assert_eq!(store.upsert(confirmed), UpsertOutcome::ConfirmedPending);

        let echo = Message::from_wire(wire("m1", "alice", "bob", "Hi", 1));
        assert_eq!(store.upsert(echo), UpsertOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mark_failed_and_remove_capture_draft() {
        let mut store = ConversationStore::new(key());
        let cid = new_correlation_id();
        store.insert_pending(pending(&cid, "Hello", 0));

        assert!(store.mark_failed(&cid));
        assert_eq!(store.ordered()[0].delivery, DeliveryState::Failed);

        let removed = store.remove(&cid).unwrap();
        assert_eq!(removed.text, "Hello");
        assert!(store.is_empty());

        // Second removal finds nothing.
        assert!(store.remove(&cid).is_none());
    }

    #[test]
    fn test_mark_failed_never_touches_confirmed_entries() {
        let mut store = ConversationStore::new(key());
        let cid = new_correlation_id();
        store.insert_pending(pending(&cid, "Hi", 0));
        store.upsert(Message::confirmed(wire("m1", "alice", "bob", "Hi", 1), cid.clone()));

        assert!(!store.mark_failed(&cid));
        assert!(store.remove(&cid).is_none());
        assert_eq!(store.ordered()[0].delivery, DeliveryState::Sent);
    }

    #[test]
    fn test_ordering_is_independent_of_arrival_order() {
        let mut store = ConversationStore::new(key());
        store.upsert(Message::from_wire(wire("m3", "bob", "alice", "third", 3)));
        store.upsert(Message::from_wire(wire("m1", "alice", "bob", "first", 1)));
        store.upsert(Message::from_wire(wire("m2", "bob", "alice", "second", 2)));
        // Same timestamp as m2: tie-break on ID.
        store.upsert(Message::from_wire(wire("m2a", "alice", "bob", "tied", 2)));

        let ids: Vec<_> = store
            .ordered()
            .iter()
            .map(|m| m.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m2a", "m3"]);
    }

    #[test]
    fn test_read_flag_is_monotonic() {
        let mut store = ConversationStore::new(key());
        let mut w = wire("m1", "bob", "alice", "hey", 0);
        w.read_flag = true;
        store.upsert(Message::from_wire(w));

        // A stale duplicate with readFlag=false must not revert it.
        let stale = Message::from_wire(wire("m1", "bob", "alice", "hey", 0));
        assert_eq!(store.upsert(stale), UpsertOutcome::Duplicate);
        assert!(store.ordered()[0].read);
    }

    #[test]
    fn test_unread_tracking_and_local_mark_read() {
        let mut store = ConversationStore::new(key());
        store.upsert(Message::from_wire(wire("m1", "bob", "alice", "one", 0)));
        store.upsert(Message::from_wire(wire("m2", "bob", "alice", "two", 1)));
        store.upsert(Message::from_wire(wire("m3", "alice", "bob", "mine", 2)));

        assert_eq!(store.unread_count_for("alice"), 2);
        assert_eq!(store.mark_read_local("alice"), 2);
        assert_eq!(store.unread_count_for("alice"), 0);
        // Repeat flips nothing.
        assert_eq!(store.mark_read_local("alice"), 0);
        // bob's copy of m3 is unaffected by alice's read state.
        assert_eq!(store.unread_count_for("bob"), 1);
    }
}
