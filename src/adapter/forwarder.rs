//! Mirrors traffic from the primary broker to a secondary one.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapter::PROTOCOL;
use crate::messaging::topic::to_topic;
use crate::messaging::{Message, MessageHandler, Publisher, Subscriber};
use crate::utils::MessagingError;

/// Subscribes to `source` on a subscriber and republishes every message to
/// `target`. Messages that entered through edge sessions are skipped; the
/// session handler already mirrored them.
pub struct Forwarder {
    id: String,
    source: String,
    target: Arc<dyn Publisher>,
}

impl Forwarder {
    pub fn new(id: &str, source: &str, target: Arc<dyn Publisher>) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            target,
        }
    }

    pub async fn forward<S>(&self, subscriber: &S) -> Result<(), MessagingError>
    where
        S: Subscriber + ?Sized,
    {
        let handler = Arc::new(ForwardHandler {
            target: self.target.clone(),
        });
        subscriber.subscribe(&self.id, &self.source, handler).await?;
        info!("Forwarding {} as {}", self.source, self.id);
        Ok(())
    }

    pub async fn stop<S>(&self, subscriber: &S) -> Result<(), MessagingError>
    where
        S: Subscriber + ?Sized,
    {
        subscriber.unsubscribe(&self.id, &self.source).await
    }
}

struct ForwardHandler {
    target: Arc<dyn Publisher>,
}

#[async_trait]
impl MessageHandler for ForwardHandler {
    async fn handle(&self, msg: Message) -> Result<(), MessagingError> {
        if msg.protocol == PROTOCOL {
            return Ok(());
        }
        let topic = to_topic(&msg.channel, &msg.subtopic)?;
        debug!("Forwarding message on {topic}");
        self.target.publish(&topic, &msg).await
    }

    fn cancel(&self) -> Result<(), MessagingError> {
        Ok(())
    }
}
