use chrono::{DateTime, Utc};
use thiserror::Error;

use pulse_core::{EtlError, RateResource};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("rate limited on {resource}, resets at {reset_at:?}")]
    RateLimited {
        resource: RateResource,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("provider rejected credentials: HTTP {status}")]
    Auth { status: u16 },

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed provider response: {0}")]
    Decode(String),

    #[error("invalid base URL: {0}")]
    BaseUrl(#[from] url::ParseError),
}

impl From<ConnectError> for EtlError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::RateLimited { resource, reset_at } => {
                EtlError::RateLimited { resource, reset_at }
            }
            ConnectError::Auth { status } => EtlError::AuthFailure(format!("HTTP {status}")),
            ConnectError::Http { status, body } if status >= 500 => {
                EtlError::Transient(format!("HTTP {status}: {body}"))
            }
            ConnectError::Http { status, body } => {
                EtlError::Permanent(format!("HTTP {status}: {body}"))
            }
            ConnectError::Transport(e) => EtlError::Transient(e.to_string()),
            ConnectError::Decode(msg) => EtlError::Permanent(msg),
            ConnectError::BaseUrl(e) => EtlError::Permanent(e.to_string()),
        }
    }
}
