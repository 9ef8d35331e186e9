use thiserror::Error;

use pulse_core::EtlError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Row codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),
}

impl StoreError {
    /// Constraint violations that survived upsert conflict resolution.
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Integrity(_) => true,
            Self::Database(sqlx::Error::Database(db)) => db.constraint().is_some(),
            _ => false,
        }
    }
}

impl From<StoreError> for EtlError {
    fn from(err: StoreError) -> Self {
        if err.is_integrity() {
            return EtlError::DataIntegrity(err.to_string());
        }
        match err {
            StoreError::Database(e) => EtlError::Transient(e.to_string()),
            StoreError::Codec(e) => EtlError::Permanent(e.to_string()),
            StoreError::NotFound(what) => EtlError::Permanent(format!("{what} not found")),
            StoreError::Conflict(msg) => EtlError::Permanent(msg),
            StoreError::Integrity(msg) => EtlError::DataIntegrity(msg),
        }
    }
}
