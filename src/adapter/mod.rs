//! The `adapter` module is the protocol session bridge.
//!
//! It terminates edge sessions (`handler`), checks every operation with the
//! auth collaborator (`auth`), reports lifecycle events to an event sink
//! (`events`) and mirrors broker traffic to secondary brokers (`forwarder`).

pub mod auth;
pub mod events;
pub mod forwarder;
pub mod handler;

use thiserror::Error;

use crate::utils::MessagingError;

pub use auth::{AuthService, AuthorizeReq, StaticAuth};
pub use events::{BrokerEventStore, Event, EventStore, LogEventStore};
pub use forwarder::Forwarder;
pub use handler::{Handler, Mirror, SessionEvent};

/// Protocol tag of messages entering through edge sessions.
pub const PROTOCOL: &str = "mqtt";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("session not connected")]
    NotConnected,
    #[error("session already connected")]
    AlreadyConnected,
    #[error("malformed topic '{0}'")]
    MalformedEdgeTopic(String),
    #[error("auth service: {0}")]
    Auth(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}
