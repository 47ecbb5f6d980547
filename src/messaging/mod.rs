//! The `messaging` module is the broker-agnostic publish/subscribe layer.
//!
//! Callers only ever see the `Publisher` and `Subscriber` capabilities. Each
//! backend (log broker, queue broker, retained-topic broker) is a
//! `Transport`, and `BrokerPubSub` turns any transport into a full pub/sub
//! with subscription tracking, acknowledgement timeouts and publish retries.

pub mod kafka;
pub mod message;
pub mod mqtt;
pub mod pubsub;
pub mod rabbitmq;
pub mod retry;
pub mod topic;
pub mod transport;

use async_trait::async_trait;
use std::sync::Arc;

pub use message::Message;
pub use pubsub::BrokerPubSub;
pub use retry::Backoff;

use crate::utils::MessagingError;

/// Receives messages delivered for a live subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Message) -> Result<(), MessagingError>;

    /// Called when the subscription is removed. No `handle` call follows.
    fn cancel(&self) -> Result<(), MessagingError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), MessagingError>;

    /// Releases the underlying connection. Idempotent.
    async fn close(&self) -> Result<(), MessagingError>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError>;

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), MessagingError>;

    /// Topics `id` is currently subscribed to.
    async fn topics(&self, id: &str) -> Vec<String>;
}

pub trait PubSub: Publisher + Subscriber {}

impl<T: Publisher + Subscriber> PubSub for T {}

#[cfg(test)]
mod tests;
