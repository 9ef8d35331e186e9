use thiserror::Error;

use pulse_core::EtlError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Unknown delivery {0}")]
    UnknownDelivery(i64),
}

impl From<BrokerError> for EtlError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Database(e) => EtlError::Transient(e.to_string()),
            BrokerError::Codec(e) => EtlError::Permanent(e.to_string()),
            BrokerError::UnknownDelivery(id) => {
                EtlError::Permanent(format!("unknown delivery {id}"))
            }
        }
    }
}
