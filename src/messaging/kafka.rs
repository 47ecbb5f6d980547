//! Log broker connector.
//!
//! Topics map one to one onto log topics and the topic itself is used as the
//! record key, so every message of a topic lands in the same partition and
//! keeps its order. Filters are evaluated by the broker against each
//! appended topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::broker::LogBroker;
use crate::messaging::transport::{Delivery, Transport, TransportClient};
use crate::utils::BrokerError;

#[derive(Debug, Clone)]
pub struct KafkaTransport {
    broker: LogBroker,
    closed: Arc<AtomicBool>,
}

impl KafkaTransport {
    pub fn new(broker: LogBroker) -> Self {
        Self {
            broker,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn broker(&self) -> &LogBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    type Client = KafkaClient;

    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let position = self.broker.produce(topic, topic.as_bytes(), payload)?;
        debug!(
            "Produced to {topic} partition {} offset {}",
            position.partition, position.offset
        );
        Ok(())
    }

    async fn dial(&self, client_id: &str) -> Result<KafkaClient, BrokerError> {
        self.ensure_open()?;
        Ok(KafkaClient {
            id: client_id.to_string(),
            broker: self.broker.clone(),
            consumers: Mutex::new(HashMap::new()),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Kafka connector closed");
        }
        Ok(())
    }
}

/// Consumer group of one subscriber: one broker consumer per filter.
#[derive(Debug)]
pub struct KafkaClient {
    id: String,
    broker: LogBroker,
    consumers: Mutex<HashMap<String, String>>,
}

impl KafkaClient {
    fn consumers(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TransportClient for KafkaClient {
    async fn subscribe(&self, filter: &str, delivery: Delivery) -> Result<(), BrokerError> {
        let consumer = self.broker.subscribe(filter, delivery)?;
        if let Some(previous) = self.consumers().insert(filter.to_string(), consumer) {
            self.broker.unsubscribe(&previous);
        }
        debug!("{} consuming {filter}", self.id);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        let Some(consumer) = self.consumers().remove(filter) else {
            return Err(BrokerError::rejected(format!("no consumer for {filter}")));
        };
        self.broker.unsubscribe(&consumer);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let consumers: Vec<String> = self.consumers().drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            self.broker.unsubscribe(&consumer);
        }
        Ok(())
    }
}
