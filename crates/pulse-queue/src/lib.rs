//! Broker gateway.
//!
//! Durable FIFO-per-queue delivery with at-least-once semantics: publish,
//! lease-based poll, ack, nack-with-retry, dead-letter after the delivery
//! budget. Queues are per tenant and per stage; there is no cross-tenant
//! fan-in.

pub mod error;
pub mod memory;
pub mod pg;

use async_trait::async_trait;

pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use pg::PgBroker;
use pulse_core::Envelope;

/// Deliveries per message before it moves to the dead-letter queue.
pub const MAX_DELIVERIES: i32 = 3;

/// Visibility timeout on a polled message.
pub const LEASE_SECONDS: i64 = 300;

/// Queue identifier: `<stage>.<tenant>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(String);

impl QueueName {
    pub fn extraction(tenant_id: i64) -> Self {
        Self(format!("extraction.{tenant_id}"))
    }

    pub fn transform(tenant_id: i64) -> Self {
        Self(format!("transform.{tenant_id}"))
    }

    pub fn embed(tenant_id: i64) -> Self {
        Self(format!("embed.{tenant_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One leased, in-flight message.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned id, used to ack or nack.
    pub delivery_id: i64,
    pub envelope: Envelope,
    /// How many times this message has been delivered, this one included.
    pub attempt: i32,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &QueueName, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Take the next visible message under a lease. `None` when the queue is
    /// empty. A message whose lease expired is delivered again.
    async fn poll(&self, queue: &QueueName) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, queue: &QueueName, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Release for redelivery, recording the failure; after `MAX_DELIVERIES`
    /// the message moves to the dead-letter queue instead.
    async fn nack(
        &self,
        queue: &QueueName,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<(), BrokerError>;
}
