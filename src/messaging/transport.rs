//! Broker-native primitives.
//!
//! A `Transport` owns the connector's physical connection and publishes raw
//! bytes; a `TransportClient` is the per-subscriber broker handle dialed by
//! the subscription manager. Both speak in normalized dot-separated topics
//! and translate them to the broker's own naming internally.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::BrokerError;

/// Channel the broker pushes raw, still-encoded payloads into.
pub type Delivery = mpsc::UnboundedSender<Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Client: TransportClient;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn dial(&self, client_id: &str) -> Result<Self::Client, BrokerError>;

    /// Releases the physical connection. Must be idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait TransportClient: Send + Sync + 'static {
    /// Resolves once the broker acknowledged the subscription.
    async fn subscribe(&self, filter: &str, delivery: Delivery) -> Result<(), BrokerError>;

    /// Resolves once the broker acknowledged the removal. No further
    /// payloads are pushed for `filter` afterwards.
    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
