use crate::envelope::InvalidEnvelope;

/// Errors raised by a [`Broker`](crate::broker::Broker) implementation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    // Transport
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("transport error: {0}")]
    Transport(String),

    // Entity lifecycle
    #[error("subscription '{name}' not found on topic '{topic}'")]
    SubscriptionNotFound { topic: String, name: String },
    #[error("subscription '{name}' already exists on topic '{topic}'")]
    SubscriptionExists { topic: String, name: String },
    #[error("receiver already closed")]
    ReceiverClosed,

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Whether the hosting process may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Transport(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Transport(_) => "transport",
            Self::SubscriptionNotFound { .. } => "subscription_not_found",
            Self::SubscriptionExists { .. } => "subscription_exists",
            Self::ReceiverClosed => "receiver_closed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors raised by a [`LocalDelivery`](crate::delivery::LocalDelivery) implementation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("failed to serialize invocation: {0}")]
    Serialization(String),
    #[error("cancelled")]
    Cancelled,
}

/// Errors raised while encoding or decoding an [`Envelope`](crate::envelope::Envelope).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid envelope: {0}")]
    Invalid(InvalidEnvelope),
}
