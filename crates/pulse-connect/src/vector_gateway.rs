//! Vector gateway client.
//!
//! `POST {model, text}` returning the embedding vector. Two endpoints per
//! tenant: primary and fallback. On primary failure or quota exhaustion the
//! fallback is used and the outcome is marked degraded so callers can emit a
//! degradation event.

use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use url::Url;

use crate::error::ConnectError;

pub struct VectorGatewayClient {
    http: reqwest::Client,
    primary: Url,
    fallback: Option<Url>,
    api_key: Option<String>,
}

/// The embedding plus whether the fallback endpoint produced it.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub vector: Vec<f32>,
    pub degraded: bool,
}

impl VectorGatewayClient {
    pub fn new(
        primary: &str,
        fallback: Option<&str>,
        api_key: Option<String>,
    ) -> Result<Self, ConnectError> {
        Ok(Self {
            http: reqwest::Client::new(),
            primary: Url::parse(primary)?,
            fallback: fallback.map(Url::parse).transpose()?,
            api_key,
        })
    }

    pub async fn embed(&self, model: &str, text: &str) -> Result<EmbedOutcome, ConnectError> {
        match self.call(&self.primary, model, text).await {
            Ok(vector) => Ok(EmbedOutcome {
                vector,
                degraded: false,
            }),
            Err(primary_err) if retry_on_fallback(&primary_err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(primary_err);
                };
                warn!(error = %primary_err, "Primary vector gateway failed, using fallback");
                let vector = self.call(fallback, model, text).await?;
                Ok(EmbedOutcome {
                    vector,
                    degraded: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn call(&self, endpoint: &Url, model: &str, text: &str) -> Result<Vec<f32>, ConnectError> {
        let mut request = self
            .http
            .post(endpoint.clone())
            .json(&json!({ "model": model, "text": text }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectError::Http {
                status: status.as_u16(),
                body,
            });
        }

        #[derive(Deserialize)]
        struct EmbedBody {
            vector: Vec<f32>,
        }
        let body: EmbedBody = response.json().await?;
        if body.vector.is_empty() {
            return Err(ConnectError::Decode("empty embedding vector".into()));
        }
        Ok(body.vector)
    }
}

/// Quota exhaustion, server errors, and transport failures fall through to
/// the fallback endpoint; credential problems do not.
fn retry_on_fallback(err: &ConnectError) -> bool {
    match err {
        ConnectError::Http { status, .. } => *status == 429 || *status >= 500,
        ConnectError::Transport(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_policy_covers_quota_and_outage_only() {
        assert!(retry_on_fallback(&ConnectError::Http {
            status: 429,
            body: String::new()
        }));
        assert!(retry_on_fallback(&ConnectError::Http {
            status: 503,
            body: String::new()
        }));
        assert!(!retry_on_fallback(&ConnectError::Http {
            status: 400,
            body: String::new()
        }));
        assert!(!retry_on_fallback(&ConnectError::Auth { status: 401 }));
    }
}
