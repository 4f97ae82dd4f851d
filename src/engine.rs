//! The conversation engine: one instance per open conversation.
//!
//! `ConversationEngine::open` loads history, spawns the live subscriber and
//! the read-receipt coordinator, and hands the presentation layer a small
//! surface: the ordered message snapshot, `send`, a broadcast event channel,
//! a viewing flag, and `close`.  The engine owns the background tasks and
//! tears them down on close or drop; after teardown nothing mutates the
//! store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::identity::IdentityProvider;
use crate::live::LiveUpdateSubscriber;
use crate::message::{ConversationKey, DeliveryState, Message};
use crate::read_receipts::{ReadReceiptCoordinator, DEFAULT_READ_DEBOUNCE};
use crate::send::{SendController, SendError};
use crate::store::{ConversationStore, SharedStore, UpsertOutcome};
use crate::transport::MessageTransport;

/// Capacity of the engine's broadcast event channel.
const EVENT_BUFFER: usize = 64;

/// Tunables for the engine's background behaviour.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window coalescing read-receipt triggers into one request.
    pub read_debounce: Duration,
    /// First retry delay after a failed subscribe (doubles per attempt).
    pub resubscribe_initial_backoff: Duration,
    /// Cap on the subscribe retry delay.
    pub resubscribe_max_backoff: Duration,
    /// Consecutive subscribe failures before each retry also polls history.
    pub poll_fallback_after: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_debounce: DEFAULT_READ_DEBOUNCE,
            resubscribe_initial_backoff: Duration::from_secs(2),
            resubscribe_max_backoff: Duration::from_secs(60),
            poll_fallback_after: 3,
        }
    }
}

/// Events broadcast to the presentation layer.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    MessageAdded {
        message_id: Option<String>,
        correlation_id: Option<String>,
        sender_id: String,
        text: String,
        created_at: DateTime<Utc>,
        delivery: DeliveryState,
    },
    SendConfirmed {
        correlation_id: String,
        message_id: String,
    },
    SendFailed {
        correlation_id: String,
        /// The original text, re-offered for the compose field.
        draft: String,
        reason: String,
    },
    MessagesMarkedRead {
        user_id: String,
        count: usize,
    },
    SubscriptionStatus {
        connected: bool,
    },
}

/// Synchronization engine for a single conversation.
pub struct ConversationEngine {
    store: SharedStore,
    sender: SendController,
    events: broadcast::Sender<ConversationEvent>,
    read_trigger: Arc<Notify>,
    viewing: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    key: ConversationKey,
    local_user_id: String,
    closed: bool,
}

impl ConversationEngine {
    /// Open a conversation with default tunables.
    pub async fn open(
        transport: Arc<dyn MessageTransport>,
        identity: &dyn IdentityProvider,
        key: ConversationKey,
    ) -> Self {
        Self::open_with_config(transport, identity, key, EngineConfig::default()).await
    }

    /// Open a conversation: load history, subscribe, start read receipts.
    ///
    /// A failed initial fetch degrades to an empty timeline rather than an
    /// error; the subscriber's reconciliation (or its polling fallback)
    /// restores consistency once the transport recovers.
    pub async fn open_with_config(
        transport: Arc<dyn MessageTransport>,
        identity: &dyn IdentityProvider,
        key: ConversationKey,
        config: EngineConfig,
    ) -> Self {
        let local_user_id = identity.local_user_id();
        let conversation_id = key.conversation_id();
        let store: SharedStore = Arc::new(Mutex::new(ConversationStore::new(key.clone())));
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let mut initially_stale = false;
        match transport.fetch_history(&conversation_id).await {
            Ok(history) => {
                let mut loaded = 0;
                let mut locked = store.lock().await;
                for wire in history {
                    if locked.upsert(Message::from_wire(wire)) == UpsertOutcome::Inserted {
                        loaded += 1;
                    }
                }
                drop(locked);
                crate::jlog!("open: loaded {} message(s) for {}", loaded, conversation_id);
            }
            Err(error) => {
                // Degraded open: the subscriber reconciles once it connects.
                initially_stale = true;
                crate::jlog!(
                    "open: history fetch failed for {}, starting empty: {}",
                    conversation_id,
                    error
                );
            }
        }

        let read_trigger = Arc::new(Notify::new());
        let viewing = Arc::new(AtomicBool::new(true));

        let subscriber = LiveUpdateSubscriber::new(
            store.clone(),
            transport.clone(),
            events.clone(),
            read_trigger.clone(),
            local_user_id.clone(),
            conversation_id.clone(),
            config.clone(),
            initially_stale,
        );
        let coordinator = ReadReceiptCoordinator::new(
            store.clone(),
            transport.clone(),
            events.clone(),
            read_trigger.clone(),
            viewing.clone(),
            local_user_id.clone(),
            conversation_id.clone(),
            config.read_debounce,
        );
        let tasks = vec![tokio::spawn(subscriber.run()), tokio::spawn(coordinator.run())];

        // Unread messages from the initial load feed the debounce too.
        if store.lock().await.unread_count_for(&local_user_id) > 0 {
            read_trigger.notify_one();
        }

        let sender = SendController::new(
            store.clone(),
            transport,
            events.clone(),
            local_user_id.clone(),
            conversation_id,
        );

        Self {
            store,
            sender,
            events,
            read_trigger,
            viewing,
            tasks,
            key,
            local_user_id,
            closed: false,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Ordered snapshot of the timeline, including pending entries.
    pub async fn messages(&self) -> Vec<Message> {
        self.store.lock().await.ordered().to_vec()
    }

    /// Send a message to `receiver_id`; see [`SendController::send`].
    pub async fn send(&self, text: &str, receiver_id: &str) -> Result<Message, SendError> {
        self.sender.send(text, receiver_id).await
    }

    /// Subscribe to engine events (new messages, send results, read acks,
    /// subscription status).
    pub fn events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Gate read receipts on whether the conversation is on screen.  Turning
    /// viewing back on re-triggers the coordinator so messages that arrived
    /// in the background get acknowledged.
    pub fn set_viewing(&self, viewing: bool) {
        self.viewing.store(viewing, Ordering::SeqCst);
        if viewing {
            self.read_trigger.notify_one();
        }
    }

    /// Tear the conversation down: release the subscription, abandon debounce
    /// timers and in-flight fetches.  No store mutation happens afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in &self.tasks {
            task.abort();
        }
        crate::jlog!("closed conversation {}", self.key.conversation_id());
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        self.close();
    }
}
