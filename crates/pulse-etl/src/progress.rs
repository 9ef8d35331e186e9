//! Progress broadcaster.
//!
//! Stages report step/stage transitions and numeric progress; subscribers
//! (status CLI, websocket fan-outs, tests) receive them over a lossy
//! broadcast channel. Not on the critical path; a lagging subscriber drops
//! events.

use serde::Serialize;
use tokio::sync::broadcast;

use pulse_core::StageStatus;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub tenant_id: i64,
    pub job_id: Option<i64>,
    pub step: String,
    /// "extraction", "transform", "embedding", or "job" for run-level events.
    pub stage: String,
    pub status: String,
    /// Fraction 0..1 within the current step, when known.
    pub fraction: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine; lost updates are acceptable.
        let _ = self.tx.send(event);
    }

    pub fn stage(
        &self,
        tenant_id: i64,
        job_id: Option<i64>,
        step: &str,
        stage: &str,
        status: StageStatus,
        fraction: Option<f32>,
    ) {
        self.emit(ProgressEvent {
            tenant_id,
            job_id,
            step: step.to_string(),
            stage: stage.to_string(),
            status: status.as_str().to_string(),
            fraction,
        });
    }

    pub fn job_status(&self, tenant_id: i64, job_id: i64, status: &str) {
        self.emit(ProgressEvent {
            tenant_id,
            job_id: Some(job_id),
            step: String::new(),
            stage: "job".to_string(),
            status: status.to_string(),
            fraction: None,
        });
    }

    /// Vector-gateway fallback in use.
    pub fn degraded(&self, tenant_id: i64, job_id: Option<i64>, detail: &str) {
        self.emit(ProgressEvent {
            tenant_id,
            job_id,
            step: String::new(),
            stage: "embedding".to_string(),
            status: format!("degraded: {detail}"),
            fraction: None,
        });
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let broadcaster = ProgressBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        broadcaster.stage(1, Some(2), "work_items", "transform", StageStatus::Finished, Some(1.0));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.step, "work_items");
        assert_eq!(event.status, "finished");
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_fine() {
        let broadcaster = ProgressBroadcaster::new(8);
        broadcaster.job_status(1, 2, "RUNNING");
    }
}
