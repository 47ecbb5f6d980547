//! The `error` module defines the error types shared by the messaging core.
//!
//! `BrokerError` is what a physical broker (or its connector) reports and
//! carries a structured classification instead of free-form text, so retry
//! decisions never depend on matching error strings. `MessagingError` is the
//! error surfaced by publishers, subscribers and the subscription manager.

use thiserror::Error;

/// Classification of a broker-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Expected to resolve shortly (leader election, flow control). Retried.
    Transient,
    /// Connection-level failure. Surfaced immediately.
    Fatal,
    /// The broker refused the request (unknown exchange, bad filter).
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn closed() -> Self {
        Self::fatal("connection closed")
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BrokerErrorKind::Transient
    }
}

/// Coarse error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller bug (empty id, topic or channel). Never retried.
    Validation,
    /// State conflict (already subscribed / not subscribed).
    Conflict,
    /// Broker acknowledgement not received in time. Caller may retry.
    Timeout,
    BrokerTransient,
    BrokerFatal,
    /// Local state diverged from the broker. Indicates a bug.
    InternalConsistency,
    Codec,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagingError {
    #[error("empty ID")]
    EmptyId,
    #[error("empty topic")]
    EmptyTopic,
    #[error("empty channel")]
    EmptyChannel,
    #[error("malformed topic")]
    MalformedTopic,
    #[error("malformed subtopic")]
    MalformedSubtopic,
    #[error("already subscribed to topic")]
    AlreadySubscribed,
    #[error("not subscribed")]
    NotSubscribed,
    #[error("failed to subscribe due to timeout reached")]
    SubscribeTimeout,
    #[error("failed to unsubscribe due to timeout reached")]
    UnsubscribeTimeout,
    #[error("failed to unsubscribe due to deletion of topic")]
    UnsubscribeDeleteTopic,
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl MessagingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyId
            | Self::EmptyTopic
            | Self::EmptyChannel
            | Self::MalformedTopic
            | Self::MalformedSubtopic => ErrorKind::Validation,
            Self::AlreadySubscribed | Self::NotSubscribed => ErrorKind::Conflict,
            Self::SubscribeTimeout | Self::UnsubscribeTimeout => ErrorKind::Timeout,
            Self::UnsubscribeDeleteTopic => ErrorKind::InternalConsistency,
            Self::Encode(_) | Self::Decode(_) | Self::Handler(_) => ErrorKind::Codec,
            Self::Broker(err) if err.is_transient() => ErrorKind::BrokerTransient,
            Self::Broker(_) => ErrorKind::BrokerFatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::BrokerTransient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_variants() {
        assert_eq!(MessagingError::EmptyId.kind(), ErrorKind::Validation);
        assert_eq!(MessagingError::NotSubscribed.kind(), ErrorKind::Conflict);
        assert_eq!(MessagingError::SubscribeTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            MessagingError::UnsubscribeDeleteTopic.kind(),
            ErrorKind::InternalConsistency
        );
        assert_eq!(
            MessagingError::from(BrokerError::transient("leader not available")).kind(),
            ErrorKind::BrokerTransient
        );
        assert_eq!(
            MessagingError::from(BrokerError::rejected("no exchange")).kind(),
            ErrorKind::BrokerFatal
        );
    }

    #[test]
    fn broker_error_displays_message() {
        assert_eq!(BrokerError::closed().to_string(), "connection closed");
        assert!(!BrokerError::closed().is_transient());
    }
}
