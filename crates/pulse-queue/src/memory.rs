//! In-memory broker.
//!
//! Same contract as the Postgres backend, held in process memory: FIFO per
//! queue, lease on poll, redelivery on nack, dead-letter after the delivery
//! budget. Used by the test suite and by `tick-once` dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use pulse_core::Envelope;

use crate::{Broker, BrokerError, Delivery, QueueName, MAX_DELIVERIES};

#[derive(Debug, Clone)]
struct Stored {
    id: i64,
    envelope: Envelope,
    attempt: i32,
}

/// A message that exhausted its delivery budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub attempts: i32,
    pub reason: String,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    leased: HashMap<i64, Stored>,
    dead: Vec<DeadLetter>,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    next_id: Mutex<i64>,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready-message depth (leased messages excluded).
    pub fn depth(&self, queue: &QueueName) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue.as_str())
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn dead_letters(&self, queue: &QueueName) -> Vec<DeadLetter> {
        self.queues
            .lock()
            .unwrap()
            .get(queue.as_str())
            .map(|q| q.dead.clone())
            .unwrap_or_default()
    }

    /// Drain every ready message without leasing, oldest first. Test helper.
    pub fn drain(&self, queue: &QueueName) -> Vec<Envelope> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(queue.as_str().to_string())
            .or_default()
            .ready
            .drain(..)
            .map(|stored| stored.envelope)
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &QueueName, envelope: &Envelope) -> Result<(), BrokerError> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            *next_id
        };
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(queue.as_str().to_string())
            .or_default()
            .ready
            .push_back(Stored {
                id,
                envelope: envelope.clone(),
                attempt: 0,
            });
        Ok(())
    }

    async fn poll(&self, queue: &QueueName) -> Result<Option<Delivery>, BrokerError> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.as_str().to_string()).or_default();
        let Some(mut stored) = state.ready.pop_front() else {
            return Ok(None);
        };
        stored.attempt += 1;
        let delivery = Delivery {
            delivery_id: stored.id,
            envelope: stored.envelope.clone(),
            attempt: stored.attempt,
        };
        state.leased.insert(stored.id, stored);
        Ok(Some(delivery))
    }

    async fn ack(&self, queue: &QueueName, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.as_str().to_string()).or_default();
        state
            .leased
            .remove(&delivery.delivery_id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(delivery.delivery_id))
    }

    async fn nack(
        &self,
        queue: &QueueName,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.as_str().to_string()).or_default();
        let stored = state
            .leased
            .remove(&delivery.delivery_id)
            .ok_or(BrokerError::UnknownDelivery(delivery.delivery_id))?;
        if stored.attempt >= MAX_DELIVERIES {
            state.dead.push(DeadLetter {
                envelope: stored.envelope,
                attempts: stored.attempt,
                reason: reason.to_string(),
            });
        } else {
            state.ready.push_back(stored);
        }
        Ok(())
    }
}
