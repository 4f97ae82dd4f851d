//! Live push consumption with gap reconciliation.
//!
//! Runs as a background task owned by the engine.  The loop keeps one
//! subscription open against the transport, dedupes pushed messages against
//! the store, and closes delivery gaps: whenever the connection drops (or the
//! subscription itself cannot be established) the timeline is flagged stale,
//! and the next time the stream is healthy a single reconciliation fetch
//! merges whatever the server accepted in the meantime.  Events that arrive
//! while that fetch is in flight are buffered and merged afterwards so the
//! final order never depends on completion order.
//!
//! If the subscription keeps failing, the loop degrades to polling
//! `fetch_history` on each retry so the conversation stays eventually
//! consistent without a live stream.

use std::sync::Arc;

use tokio::sync::{broadcast, Notify};

use crate::engine::{ConversationEvent, EngineConfig};
use crate::logging;
use crate::message::{Message, WireMessage};
use crate::store::{SharedStore, UpsertOutcome};
use crate::transport::{
    ConnectionState, MessageTransport, Subscription, SubscriptionEvent, TransportError,
};

pub(crate) struct LiveUpdateSubscriber {
    store: SharedStore,
    transport: Arc<dyn MessageTransport>,
    events: broadcast::Sender<ConversationEvent>,
    read_trigger: Arc<Notify>,
    local_user_id: String,
    conversation_id: String,
    config: EngineConfig,
    /// Whether the transport stream is currently believed healthy.
    connected: bool,
    /// Whether events may have been dropped since the last full merge.
    stale: bool,
}

impl LiveUpdateSubscriber {
    pub(crate) fn new(
        store: SharedStore,
        transport: Arc<dyn MessageTransport>,
        events: broadcast::Sender<ConversationEvent>,
        read_trigger: Arc<Notify>,
        local_user_id: String,
        conversation_id: String,
        config: EngineConfig,
        initially_stale: bool,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            read_trigger,
            local_user_id,
            conversation_id,
            config,
            connected: false,
            stale: initially_stale,
        }
    }

    /// Subscribe loop with exponential backoff; runs until the engine aborts
    /// the task.
    pub(crate) async fn run(mut self) {
        let mut backoff = self.config.resubscribe_initial_backoff;
        let mut consecutive_failures = 0u32;

        loop {
            match self.transport.subscribe(&self.conversation_id).await {
                Ok(mut subscription) => {
                    consecutive_failures = 0;
                    backoff = self.config.resubscribe_initial_backoff;
                    self.connected = true;
                    crate::jlog!("live: subscribed to {}", self.conversation_id);
                    let _ = self
                        .events
                        .send(ConversationEvent::SubscriptionStatus { connected: true });

                    self.pump(&mut subscription).await;

                    // The event stream closed underneath us; anything pushed
                    // from here on is lost until we resubscribe.
                    self.connected = false;
                    self.stale = true;
                    let _ = self
                        .events
                        .send(ConversationEvent::SubscriptionStatus { connected: false });
                    crate::jlog!(
                        "live: event stream closed, resubscribing in {:?}",
                        backoff
                    );
                }
                Err(error) => {
                    consecutive_failures += 1;
                    self.connected = false;
                    self.stale = true;
                    let _ = self
                        .events
                        .send(ConversationEvent::SubscriptionStatus { connected: false });
                    crate::jlog!(
                        "live: subscribe failed (attempt {}, retry in {:?}): {}",
                        consecutive_failures,
                        backoff,
                        error
                    );
                    if consecutive_failures >= self.config.poll_fallback_after {
                        self.poll_history().await;
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.resubscribe_max_backoff);
        }
    }

    /// Consume one subscription until its channel closes, reconciling
    /// whenever the stream is healthy but the timeline is stale.
    async fn pump(&mut self, subscription: &mut Subscription) {
        let mut retry_in = self.config.resubscribe_initial_backoff;

        loop {
            if self.stale && self.connected {
                match self.reconcile(subscription).await {
                    Ok((merged, buffered)) => {
                        self.stale = false;
                        retry_in = self.config.resubscribe_initial_backoff;
                        if merged > 0 {
                            crate::jlog!("live: reconciliation merged {} message(s)", merged);
                        }
                        // Events buffered while the fetch was in flight merge
                        // afterwards, in arrival order.
                        for event in buffered {
                            self.handle_event(event).await;
                        }
                        continue;
                    }
                    Err(error) => {
                        crate::jlog!(
                            "live: reconciliation fetch failed (retry in {:?}): {}",
                            retry_in,
                            error
                        );
                        // Keep accepting pushes while waiting to retry;
                        // upserts are idempotent so applying them early is
                        // safe.
                        tokio::select! {
                            _ = tokio::time::sleep(retry_in) => {}
                            maybe = subscription.events.recv() => match maybe {
                                Some(event) => self.handle_event(event).await,
                                None => return,
                            }
                        }
                        retry_in = (retry_in * 2).min(self.config.resubscribe_max_backoff);
                        continue;
                    }
                }
            }

            match subscription.events.recv().await {
                Some(event) => self.handle_event(event).await,
                None => return,
            }
        }
    }

    async fn handle_event(&mut self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::MessageCreated(wire) => self.apply(wire).await,
            SubscriptionEvent::ConnectionChanged(state) => match state {
                ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                    if !self.stale {
                        crate::jlog!("live: connection lost, timeline flagged stale");
                    }
                    self.connected = false;
                    self.stale = true;
                    let _ = self
                        .events
                        .send(ConversationEvent::SubscriptionStatus { connected: false });
                }
                ConnectionState::Connected => {
                    self.connected = true;
                    let _ = self
                        .events
                        .send(ConversationEvent::SubscriptionStatus { connected: true });
                    // The pump loop reconciles before the next recv if the
                    // timeline went stale.
                }
            },
        }
    }

    /// Merge one pushed message; duplicates are discarded by the store.
    async fn apply(&self, wire: WireMessage) {
        let message = Message::from_wire(wire);
        let outcome = {
            let mut store = self.store.lock().await;
            store.upsert(message.clone())
        };
        if outcome == UpsertOutcome::Inserted {
            self.announce(&message);
        }
    }

    /// One reconciliation fetch.  Pushes that arrive while the fetch is in
    /// flight are buffered and handed back to the caller to merge after the
    /// fetch result, preserving arrival order.
    async fn reconcile(
        &mut self,
        subscription: &mut Subscription,
    ) -> Result<(usize, Vec<SubscriptionEvent>), TransportError> {
        let fetch = self.transport.fetch_history(&self.conversation_id);
        tokio::pin!(fetch);

        let mut buffered = Vec::new();
        let mut stream_lost = false;
        let history = loop {
            tokio::select! {
                result = &mut fetch => break result?,
                maybe = subscription.events.recv(), if !stream_lost => match maybe {
                    Some(event) => buffered.push(event),
                    None => stream_lost = true,
                }
            }
        };

        let merged = self.merge_history(history).await;
        Ok((merged, buffered))
    }

    /// Poll-based fallback used while the subscription cannot be established.
    async fn poll_history(&mut self) {
        match self.transport.fetch_history(&self.conversation_id).await {
            Ok(history) => {
                let merged = self.merge_history(history).await;
                if merged > 0 {
                    crate::jlog!("live: history poll merged {} message(s)", merged);
                }
            }
            Err(error) => {
                crate::jlog!("live: history poll failed: {}", error);
            }
        }
    }

    /// Upsert a fetched history batch under one lock acquisition, then
    /// announce the genuinely new arrivals.
    async fn merge_history(&self, history: Vec<WireMessage>) -> usize {
        let mut inserted = Vec::new();
        {
            let mut store = self.store.lock().await;
            for wire in history {
                let message = Message::from_wire(wire);
                if store.upsert(message.clone()) == UpsertOutcome::Inserted {
                    inserted.push(message);
                }
            }
        }
        for message in &inserted {
            self.announce(message);
        }
        inserted.len()
    }

    fn announce(&self, message: &Message) {
        let id = message.id.as_deref().unwrap_or_default();
        crate::jlog!(
            "live: stored {} from {}",
            logging::msg_id(id),
            logging::user_id(&message.sender_id)
        );
        let _ = self.events.send(ConversationEvent::MessageAdded {
            message_id: message.id.clone(),
            correlation_id: None,
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            created_at: message.created_at,
            delivery: message.delivery,
        });
        // Arrivals from the other participant feed the read-receipt debounce.
        if message.sender_id != self.local_user_id && !message.read {
            self.read_trigger.notify_one();
        }
    }
}
