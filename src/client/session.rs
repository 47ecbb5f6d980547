use std::sync::OnceLock;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use uuid::Uuid;

use crate::messaging::Message;

/// A connected edge session.
///
/// The id is also the key the session's subscriptions are registered under.
/// The identity is set once, by a successful connect, and never changes.
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for the session (client id or generated).
    pub id: String,

    identity: OnceLock<String>,

    /// Channel messages delivered to the session are written to.
    outbound: UnboundedSender<Message>,

    cancel: watch::Sender<bool>,
}

impl Session {
    pub fn new(id: Option<String>, outbound: UnboundedSender<Message>) -> Self {
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));
        let (cancel, _) = watch::channel(false);
        Self {
            id,
            identity: OnceLock::new(),
            outbound,
            cancel,
        }
    }

    /// Identity of the authenticated thing, once connected.
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Returns `false` if an identity was already set.
    pub fn set_identity(&self, identity: String) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub fn outbound(&self) -> UnboundedSender<Message> {
        self.outbound.clone()
    }

    /// Cancels every operation the session still has in flight.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives in `self`, so the wait can only end by cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
