//! Broker contract tests against the in-memory backend.

use pulse_core::ids::new_message_id;
use pulse_core::{ControlFlags, Envelope, ExtractSpec, Payload, ProviderKind, RelayFlags};
use pulse_queue::{Broker, MemoryBroker, QueueName, MAX_DELIVERIES};

fn envelope(tenant_id: i64, step: &str) -> Envelope {
    Envelope {
        message_id: new_message_id(),
        tenant_id,
        integration_id: Some(1),
        job_id: Some(1),
        provider: ProviderKind::Issues,
        step: step.into(),
        payload: Payload::Extract(ExtractSpec::Projects),
        flags: ControlFlags::seed(),
        relay: RelayFlags::default(),
        old_last_sync_date: None,
        new_last_sync_date: None,
    }
}

#[tokio::test]
async fn publish_then_poll_is_fifo() {
    let broker = MemoryBroker::new();
    let queue = QueueName::extraction(1);

    broker.publish(&queue, &envelope(1, "a")).await.unwrap();
    broker.publish(&queue, &envelope(1, "b")).await.unwrap();

    let first = broker.poll(&queue).await.unwrap().unwrap();
    let second = broker.poll(&queue).await.unwrap().unwrap();
    assert_eq!(first.envelope.step, "a");
    assert_eq!(second.envelope.step, "b");
    assert!(broker.poll(&queue).await.unwrap().is_none());
}

#[tokio::test]
async fn queues_are_isolated_per_tenant() {
    let broker = MemoryBroker::new();
    broker
        .publish(&QueueName::extraction(1), &envelope(1, "t1"))
        .await
        .unwrap();

    assert!(broker
        .poll(&QueueName::extraction(2))
        .await
        .unwrap()
        .is_none());
    assert!(broker
        .poll(&QueueName::extraction(1))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn ack_removes_and_nack_redelivers() {
    let broker = MemoryBroker::new();
    let queue = QueueName::transform(5);
    broker.publish(&queue, &envelope(5, "x")).await.unwrap();

    let delivery = broker.poll(&queue).await.unwrap().unwrap();
    assert_eq!(delivery.attempt, 1);
    broker.nack(&queue, &delivery, "boom").await.unwrap();

    let redelivered = broker.poll(&queue).await.unwrap().unwrap();
    assert_eq!(redelivered.attempt, 2);
    assert_eq!(redelivered.envelope.step, "x");
    broker.ack(&queue, &redelivered).await.unwrap();
    assert!(broker.poll(&queue).await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_deliveries_land_in_the_dlq() {
    let broker = MemoryBroker::new();
    let queue = QueueName::embed(9);
    broker.publish(&queue, &envelope(9, "poison")).await.unwrap();

    for _ in 0..MAX_DELIVERIES {
        let delivery = broker.poll(&queue).await.unwrap().unwrap();
        broker.nack(&queue, &delivery, "parse failure").await.unwrap();
    }

    assert!(broker.poll(&queue).await.unwrap().is_none());
    let dead = broker.dead_letters(&queue);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, MAX_DELIVERIES);
    assert_eq!(dead[0].reason, "parse failure");
}

#[tokio::test]
async fn double_ack_is_an_error() {
    let broker = MemoryBroker::new();
    let queue = QueueName::embed(2);
    broker.publish(&queue, &envelope(2, "once")).await.unwrap();

    let delivery = broker.poll(&queue).await.unwrap().unwrap();
    broker.ack(&queue, &delivery).await.unwrap();
    assert!(broker.ack(&queue, &delivery).await.is_err());
}
