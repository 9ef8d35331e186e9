//! Rate-limit snapshots.
//!
//! Providers report budget in `x-ratelimit-*` response headers. Clients keep
//! the latest snapshot per resource class and refuse to issue a request once
//! the remaining budget falls to the safety threshold, leaving headroom for
//! other consumers of the same token.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;

use pulse_core::RateResource;

/// Remaining-call floor below which extraction checkpoints instead of
/// continuing.
pub const SAFETY_THRESHOLD: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSnapshot {
    pub resource: RateResource,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSnapshot {
    /// Parse the standard header triple; `None` when the provider sent none.
    pub fn from_headers(resource: RateResource, headers: &HeaderMap) -> Option<Self> {
        let remaining = header_i64(headers, "x-ratelimit-remaining")?;
        let limit = header_i64(headers, "x-ratelimit-limit").unwrap_or(remaining);
        let reset_at = header_i64(headers, "x-ratelimit-reset")
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
        Some(Self {
            resource,
            remaining,
            limit,
            reset_at,
        })
    }

    pub fn exhausted(&self) -> bool {
        self.remaining <= SAFETY_THRESHOLD
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

/// Latest snapshot per resource class, shared across a client's requests.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    snapshots: Mutex<HashMap<RateResource, RateLimitSnapshot>>,
}

impl RateLimitTracker {
    pub fn record(&self, snapshot: RateLimitSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.resource, snapshot);
    }

    pub fn record_headers(&self, resource: RateResource, headers: &HeaderMap) {
        if let Some(snapshot) = RateLimitSnapshot::from_headers(resource, headers) {
            self.record(snapshot);
        }
    }

    pub fn snapshot(&self, resource: RateResource) -> Option<RateLimitSnapshot> {
        self.snapshots.lock().unwrap().get(&resource).copied()
    }

    /// The budget check run before every external call.
    pub fn ensure_budget(&self, resource: RateResource) -> Result<(), crate::ConnectError> {
        if let Some(snapshot) = self.snapshot(resource) {
            if snapshot.exhausted() {
                return Err(crate::ConnectError::RateLimited {
                    resource,
                    reset_at: snapshot.reset_at,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(remaining: &str, limit: &str, reset: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-ratelimit-remaining", HeaderValue::from_str(remaining).unwrap());
        map.insert("x-ratelimit-limit", HeaderValue::from_str(limit).unwrap());
        map.insert("x-ratelimit-reset", HeaderValue::from_str(reset).unwrap());
        map
    }

    #[test]
    fn parses_the_header_triple() {
        let snapshot =
            RateLimitSnapshot::from_headers(RateResource::Search, &headers("28", "30", "1700000000"))
                .unwrap();
        assert_eq!(snapshot.remaining, 28);
        assert_eq!(snapshot.limit, 30);
        assert_eq!(
            snapshot.reset_at.unwrap(),
            Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
        );
        assert!(!snapshot.exhausted());
    }

    #[test]
    fn missing_headers_yield_none() {
        assert!(RateLimitSnapshot::from_headers(RateResource::Core, &HeaderMap::new()).is_none());
    }

    #[test]
    fn budget_check_trips_at_the_threshold() {
        let tracker = RateLimitTracker::default();
        assert!(tracker.ensure_budget(RateResource::Graphql).is_ok());

        tracker.record_headers(
            RateResource::Graphql,
            &headers(&SAFETY_THRESHOLD.to_string(), "5000", "1700000000"),
        );
        let err = tracker.ensure_budget(RateResource::Graphql).unwrap_err();
        assert!(matches!(
            err,
            crate::ConnectError::RateLimited {
                resource: RateResource::Graphql,
                ..
            }
        ));
    }
}
