//! Debounced, idempotent read-receipt propagation.
//!
//! Runs as a background task owned by the engine.  The subscriber (and the
//! engine, on initial load or when the view regains focus) signals the
//! trigger whenever an unread message addressed to the local user may exist.
//! One debounce window later the coordinator checks the store and issues at
//! most one `mark_read` call; a burst of arrivals inside the window collapses
//! into a single request.
//!
//! On success all currently-known unread entries flip locally, so re-triggers
//! with nothing new find zero unread and suppress the transport call.  A
//! failure is logged and retried at the next trigger; it is never surfaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};

use crate::engine::ConversationEvent;
use crate::logging;
use crate::store::SharedStore;
use crate::transport::MessageTransport;

/// Default debounce window for coalescing mark-read requests.
pub const DEFAULT_READ_DEBOUNCE: Duration = Duration::from_millis(400);

pub(crate) struct ReadReceiptCoordinator {
    store: SharedStore,
    transport: Arc<dyn MessageTransport>,
    events: broadcast::Sender<ConversationEvent>,
    trigger: Arc<Notify>,
    /// Mark-read fires only while the conversation is actively viewed.
    viewing: Arc<AtomicBool>,
    local_user_id: String,
    conversation_id: String,
    debounce: Duration,
}

impl ReadReceiptCoordinator {
    pub(crate) fn new(
        store: SharedStore,
        transport: Arc<dyn MessageTransport>,
        events: broadcast::Sender<ConversationEvent>,
        trigger: Arc<Notify>,
        viewing: Arc<AtomicBool>,
        local_user_id: String,
        conversation_id: String,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            trigger,
            viewing,
            local_user_id,
            conversation_id,
            debounce,
        }
    }

    /// Trigger/debounce/flush loop; runs until the engine aborts the task.
    pub(crate) async fn run(self) {
        loop {
            self.trigger.notified().await;
            // Debounce: further triggers during this window leave a stored
            // permit behind, and the follow-up pass finds nothing unread.
            tokio::time::sleep(self.debounce).await;

            if !self.viewing.load(Ordering::SeqCst) {
                continue;
            }
            let unread = {
                let store = self.store.lock().await;
                store.unread_count_for(&self.local_user_id)
            };
            if unread == 0 {
                // Nothing new since the last success; no transport call.
                continue;
            }

            match self
                .transport
                .mark_read(&self.conversation_id, &self.local_user_id)
                .await
            {
                Ok(()) => {
                    let count = {
                        let mut store = self.store.lock().await;
                        store.mark_read_local(&self.local_user_id)
                    };
                    if count > 0 {
                        crate::jlog!(
                            "read: acked {} message(s) for {}",
                            count,
                            logging::user_id(&self.local_user_id)
                        );
                        let _ = self.events.send(ConversationEvent::MessagesMarkedRead {
                            user_id: self.local_user_id.clone(),
                            count,
                        });
                    }
                }
                Err(error) => {
                    // Never fatal, never shown; the next arrival retries.
                    crate::jlog!("read: mark-read failed, will retry at next trigger: {}", error);
                }
            }
        }
    }
}
