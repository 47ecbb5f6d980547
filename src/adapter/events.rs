//! Session lifecycle events sent to the event sink.
//!
//! Events are encoded as flat JSON maps carrying an `operation` field, the
//! thing id, the adapter instance and the time they occurred at.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::adapter::PROTOCOL;
use crate::messaging::{Message, Publisher};
use crate::utils::MessagingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect {
        thing_id: String,
        instance: String,
        occurred_at: i64,
    },
    Disconnect {
        thing_id: String,
        instance: String,
        occurred_at: i64,
    },
    Subscribe {
        thing_id: String,
        channel: String,
        subtopic: String,
        instance: String,
        occurred_at: i64,
    },
    Unsubscribe {
        thing_id: String,
        channel: String,
        subtopic: String,
        instance: String,
        occurred_at: i64,
    },
}

impl Event {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "mqtt.connect",
            Self::Disconnect { .. } => "mqtt.disconnect",
            Self::Subscribe { .. } => "mqtt.subscribe",
            Self::Unsubscribe { .. } => "mqtt.unsubscribe",
        }
    }

    pub fn thing_id(&self) -> &str {
        match self {
            Self::Connect { thing_id, .. }
            | Self::Disconnect { thing_id, .. }
            | Self::Subscribe { thing_id, .. }
            | Self::Unsubscribe { thing_id, .. } => thing_id,
        }
    }

    pub fn encode(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("operation".into(), json!(self.operation()));
        match self {
            Self::Connect {
                thing_id,
                instance,
                occurred_at,
            }
            | Self::Disconnect {
                thing_id,
                instance,
                occurred_at,
            } => {
                map.insert("thing_id".into(), json!(thing_id));
                map.insert("instance".into(), json!(instance));
                map.insert("occurred_at".into(), json!(occurred_at));
            }
            Self::Subscribe {
                thing_id,
                channel,
                subtopic,
                instance,
                occurred_at,
            }
            | Self::Unsubscribe {
                thing_id,
                channel,
                subtopic,
                instance,
                occurred_at,
            } => {
                map.insert("thing_id".into(), json!(thing_id));
                map.insert("channel".into(), json!(channel));
                if !subtopic.is_empty() {
                    map.insert("subtopic".into(), json!(subtopic));
                }
                map.insert("instance".into(), json!(instance));
                map.insert("occurred_at".into(), json!(occurred_at));
            }
        }
        map
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), MessagingError>;
}

/// Publishes events on a stream topic of any broker.
pub struct BrokerEventStore {
    publisher: Arc<dyn Publisher>,
    stream: String,
}

impl BrokerEventStore {
    pub fn new(publisher: Arc<dyn Publisher>, stream: &str) -> Self {
        Self {
            publisher,
            stream: stream.to_string(),
        }
    }
}

#[async_trait]
impl EventStore for BrokerEventStore {
    async fn publish(&self, event: Event) -> Result<(), MessagingError> {
        let payload = serde_json::to_vec(&event.encode())
            .map_err(|e| MessagingError::Encode(e.to_string()))?;
        let msg = Message {
            publisher: event.thing_id().to_string(),
            protocol: PROTOCOL.to_string(),
            payload,
            created: Message::now(),
            ..Message::default()
        };
        self.publisher.publish(&self.stream, &msg).await
    }
}

/// Event sink that only logs.
#[derive(Debug, Default)]
pub struct LogEventStore;

#[async_trait]
impl EventStore for LogEventStore {
    async fn publish(&self, event: Event) -> Result<(), MessagingError> {
        info!(
            operation = event.operation(),
            thing_id = event.thing_id(),
            "session event"
        );
        Ok(())
    }
}
