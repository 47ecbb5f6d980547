//! Session event handling.
//!
//! `Handler` turns the events of an edge session into auth checks, topic
//! resolution and calls on the primary pub/sub. Every broker operation a
//! session starts is raced against the session's cancellation, so a
//! disconnect never waits on work the session no longer needs.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::adapter::auth::{AuthService, AuthorizeReq, PUBLISH, SUBSCRIBE};
use crate::adapter::events::{Event, EventStore};
use crate::adapter::{AdapterError, PROTOCOL};
use crate::client::Session;
use crate::messaging::topic::{matches, parse_edge_topic, to_topic};
use crate::messaging::{Message, MessageHandler, PubSub, Publisher};
use crate::utils::MessagingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `username` is the thing id, `password` its key.
    Connect { username: String, password: String },
    Publish { topic: String, payload: Vec<u8> },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Disconnect,
}

/// Secondary broker receiving a copy of every publish whose topic matches
/// `source`.
#[derive(Clone)]
pub struct Mirror {
    pub name: String,
    pub source: String,
    pub target: Arc<dyn Publisher>,
}

pub struct Handler {
    primary: Arc<dyn PubSub>,
    mirrors: Vec<Mirror>,
    auth: Arc<dyn AuthService>,
    events: Arc<dyn EventStore>,
    instance: String,
}

impl Handler {
    pub fn new(
        primary: Arc<dyn PubSub>,
        auth: Arc<dyn AuthService>,
        events: Arc<dyn EventStore>,
        instance: &str,
    ) -> Self {
        Self {
            primary,
            mirrors: Vec::new(),
            auth,
            events,
            instance: instance.to_string(),
        }
    }

    pub fn with_mirrors(mut self, mirrors: Vec<Mirror>) -> Self {
        self.mirrors = mirrors;
        self
    }

    pub async fn handle(&self, session: &Session, event: SessionEvent) -> Result<(), AdapterError> {
        match event {
            SessionEvent::Connect { username, password } => {
                self.connect(session, &username, &password).await
            }
            SessionEvent::Publish { topic, payload } => {
                self.publish(session, &topic, payload).await
            }
            SessionEvent::Subscribe { topic } => self.subscribe(session, &topic).await,
            SessionEvent::Unsubscribe { topic } => self.unsubscribe(session, &topic).await,
            SessionEvent::Disconnect => {
                self.disconnect(session).await;
                Ok(())
            }
        }
    }

    async fn connect(
        &self,
        session: &Session,
        username: &str,
        password: &str,
    ) -> Result<(), AdapterError> {
        if session.identity().is_some() {
            return Err(AdapterError::AlreadyConnected);
        }
        let thing_id = guarded(session, self.auth.identify(password)).await?;
        if thing_id != username {
            warn!("Session {} presented key of {thing_id} as {username}", session.id);
            return Err(AdapterError::Unauthorized);
        }
        if !session.set_identity(thing_id.clone()) {
            return Err(AdapterError::AlreadyConnected);
        }
        info!("Thing {thing_id} connected as {}", session.id);
        self.telemetry(Event::Connect {
            thing_id,
            instance: self.instance.clone(),
            occurred_at: Message::now(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        session: &Session,
        edge_topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), AdapterError> {
        let thing_id = connected(session)?;
        let (channel, subtopic) = parse(edge_topic)?;
        self.authorize(session, thing_id, &channel, PUBLISH).await?;

        let topic = to_topic(&channel, &subtopic)?;
        let msg = Message {
            channel,
            subtopic,
            publisher: thing_id.to_string(),
            protocol: PROTOCOL.to_string(),
            payload,
            created: Message::now(),
        };
        guarded(session, async {
            self.primary.publish(&topic, &msg).await.map_err(AdapterError::from)
        })
        .await?;

        for mirror in self.mirrors.iter().filter(|m| matches(&m.source, &topic)) {
            let forwarded = guarded(session, async {
                mirror.target.publish(&topic, &msg).await.map_err(AdapterError::from)
            })
            .await;
            if let Err(err) = forwarded {
                warn!("Failed to forward {topic} to {}: {err}", mirror.name);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, session: &Session, edge_topic: &str) -> Result<(), AdapterError> {
        let thing_id = connected(session)?;
        let (channel, subtopic) = parse(edge_topic)?;
        self.authorize(session, thing_id, &channel, SUBSCRIBE).await?;

        let topic = to_topic(&channel, &subtopic)?;
        let handler = Arc::new(SessionHandler {
            session: session.id.clone(),
            outbound: session.outbound(),
        });
        guarded(session, async {
            self.primary
                .subscribe(&session.id, &topic, handler)
                .await
                .map_err(AdapterError::from)
        })
        .await?;

        self.telemetry(Event::Subscribe {
            thing_id: thing_id.to_string(),
            channel,
            subtopic,
            instance: self.instance.clone(),
            occurred_at: Message::now(),
        });
        Ok(())
    }

    async fn unsubscribe(&self, session: &Session, edge_topic: &str) -> Result<(), AdapterError> {
        let thing_id = connected(session)?;
        let (channel, subtopic) = parse(edge_topic)?;
        self.authorize(session, thing_id, &channel, SUBSCRIBE).await?;

        let topic = to_topic(&channel, &subtopic)?;
        guarded(session, async {
            self.primary
                .unsubscribe(&session.id, &topic)
                .await
                .map_err(AdapterError::from)
        })
        .await?;

        self.telemetry(Event::Unsubscribe {
            thing_id: thing_id.to_string(),
            channel,
            subtopic,
            instance: self.instance.clone(),
            occurred_at: Message::now(),
        });
        Ok(())
    }

    /// Cancels the session and removes every subscription it still holds.
    /// Failures are logged; the session is gone either way.
    async fn disconnect(&self, session: &Session) {
        session.cancel();
        for topic in self.primary.topics(&session.id).await {
            match self.primary.unsubscribe(&session.id, &topic).await {
                Ok(()) => debug!("Removed {topic} for {}", session.id),
                Err(MessagingError::UnsubscribeDeleteTopic) => {
                    error!(
                        "Subscription state of {} diverged from the broker on {topic}",
                        session.id
                    );
                }
                Err(err) => warn!("Failed to unsubscribe {} from {topic}: {err}", session.id),
            }
        }
        if let Some(thing_id) = session.identity() {
            info!("Thing {thing_id} disconnected from {}", session.id);
            self.telemetry(Event::Disconnect {
                thing_id: thing_id.to_string(),
                instance: self.instance.clone(),
                occurred_at: Message::now(),
            });
        }
    }

    async fn authorize(
        &self,
        session: &Session,
        thing_id: &str,
        channel: &str,
        action: &str,
    ) -> Result<(), AdapterError> {
        let req = AuthorizeReq::thing(thing_id, channel, action);
        if guarded(session, self.auth.authorize(&req)).await? {
            return Ok(());
        }
        warn!("Thing {thing_id} may not {action} on {channel}");
        Err(AdapterError::Forbidden)
    }

    /// Sends an event without waiting for the sink.
    fn telemetry(&self, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let operation = event.operation();
            if let Err(err) = events.publish(event).await {
                warn!("Failed to store {operation} event: {err}");
            }
        });
    }
}

fn connected(session: &Session) -> Result<&str, AdapterError> {
    session.identity().ok_or(AdapterError::NotConnected)
}

fn parse(edge_topic: &str) -> Result<(String, String), AdapterError> {
    parse_edge_topic(edge_topic).map_err(|err| match err {
        MessagingError::MalformedTopic => AdapterError::MalformedEdgeTopic(edge_topic.to_string()),
        other => AdapterError::Messaging(other),
    })
}

/// Runs `op` unless the session is cancelled first.
async fn guarded<T>(
    session: &Session,
    op: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::select! {
        biased;
        _ = session.cancelled() => Err(AdapterError::Cancelled),
        result = op => result,
    }
}

/// Writes messages delivered to a session's subscription onto its outbound
/// stream.
struct SessionHandler {
    session: String,
    outbound: UnboundedSender<Message>,
}

#[async_trait]
impl MessageHandler for SessionHandler {
    async fn handle(&self, msg: Message) -> Result<(), MessagingError> {
        self.outbound
            .send(msg)
            .map_err(|_| MessagingError::Handler(format!("session {} closed", self.session)))
    }

    fn cancel(&self) -> Result<(), MessagingError> {
        Ok(())
    }
}
