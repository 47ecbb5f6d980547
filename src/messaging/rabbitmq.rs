//! Exchange broker connector.
//!
//! Messages are published to a single topic exchange with the topic as the
//! routing key. Each subscription gets its own exclusive queue named
//! `<client>.<topic>`, bound to the exchange with the subscription filter.
//! Removing the subscription cancels the consumer and deletes the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::broker::ExchangeBroker;
use crate::messaging::transport::{Delivery, Transport, TransportClient};
use crate::utils::BrokerError;

pub const DEFAULT_EXCHANGE: &str = "messages";

#[derive(Debug, Clone)]
pub struct RabbitTransport {
    broker: ExchangeBroker,
    exchange: String,
    closed: Arc<AtomicBool>,
}

impl RabbitTransport {
    /// Declares `exchange` on the broker and returns a connector bound to it.
    pub fn new(broker: ExchangeBroker, exchange: &str) -> Self {
        broker.declare_exchange(exchange);
        Self {
            broker,
            exchange: exchange.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn broker(&self) -> &ExchangeBroker {
        &self.broker
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RabbitTransport {
    type Client = RabbitClient;

    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let routed = self.broker.publish(&self.exchange, topic, payload)?;
        debug!("Routed {topic} to {routed} queues");
        Ok(())
    }

    async fn dial(&self, client_id: &str) -> Result<RabbitClient, BrokerError> {
        self.ensure_open()?;
        Ok(RabbitClient {
            id: client_id.to_string(),
            broker: self.broker.clone(),
            exchange: self.exchange.clone(),
            queues: Mutex::new(HashMap::new()),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("RabbitMQ connector closed");
        }
        Ok(())
    }
}

/// Channel of one subscriber; owns its exclusive queues.
#[derive(Debug)]
pub struct RabbitClient {
    id: String,
    broker: ExchangeBroker,
    exchange: String,
    queues: Mutex<HashMap<String, String>>,
}

impl RabbitClient {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TransportClient for RabbitClient {
    async fn subscribe(&self, filter: &str, delivery: Delivery) -> Result<(), BrokerError> {
        let queue = format!("{}.{filter}", self.id);
        self.broker.declare_queue(&queue, Some(&self.id))?;
        let attached = self
            .broker
            .bind(&queue, &self.exchange, &to_binding(filter))
            .and_then(|()| self.broker.consume(&queue, delivery));
        if let Err(err) = attached {
            self.broker.delete_queue(&queue);
            return Err(err);
        }
        debug!("{} consuming queue {queue}", self.id);
        self.queues().insert(filter.to_string(), queue);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        let Some(queue) = self.queues().remove(filter) else {
            return Err(BrokerError::rejected(format!("no queue for {filter}")));
        };
        self.broker.cancel(&queue);
        self.broker.delete_queue(&queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.queues().clear();
        self.broker.close_owner(&self.id);
        Ok(())
    }
}

/// Translates a subscription filter to a binding pattern.
pub fn to_binding(filter: &str) -> String {
    filter
        .split('.')
        .map(|segment| if segment == ">" { "#" } else { segment })
        .collect::<Vec<_>>()
        .join(".")
}
