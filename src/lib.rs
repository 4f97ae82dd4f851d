//! Conversation synchronization engine for job-scoped direct messaging.
//!
//! One [`engine::ConversationEngine`] per open conversation reconciles a
//! locally cached timeline against optimistic sends, pushed events, and
//! read-receipt propagation, surviving network failure, out-of-order
//! delivery, and subscription gaps without duplicating or losing messages.
//!
//! The delivery transport and user identity stay abstract: callers supply a
//! [`transport::MessageTransport`] and an [`identity::IdentityProvider`].

pub mod engine;
pub mod identity;
pub mod logging;
pub mod message;
pub mod send;
pub mod store;
pub mod transport;

mod live;
mod read_receipts;
