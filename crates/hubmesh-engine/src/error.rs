use hubmesh_core::errors::{BrokerError, DeliveryError, EnvelopeError};

#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("local delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("no local delivery registered for hub '{0}'")]
    UnknownHub(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("cancelled")]
    Cancelled,
}

impl BackplaneError {
    /// Cancellation surfaced by any layer.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Broker(BrokerError::Cancelled)
                | Self::Delivery(DeliveryError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackplaneError>;
