//! Integration tests for the per-partition transport.
//!
//! Covers FIFO delivery inside a partition, parallel delivery across
//! partitions, lock contention between receivers and stale redelivery.

use chrono::{Duration, Utc};
use lanes::*;
use lanes_testkit::TestHarness;

fn run_ids(claims: &[Claim]) -> Vec<i64> {
    claims
        .iter()
        .filter_map(|claim| match claim.envelope.message() {
            QueueMessage::RunPhase(message) => Some(message.run_id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_partition_delivers_in_order_without_overlap() {
    let harness = TestHarness::new();
    for run_id in 1..=3 {
        harness.enqueue_phase(run_id, 7, Phase::Prepare).await.unwrap();
    }

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let claims = harness.transport.poll().await.unwrap();
        assert_eq!(claims.len(), 1, "one claim per partition per poll");

        let blocked = harness.transport.poll().await.unwrap();
        assert!(blocked.is_empty(), "partition must stay locked until settled");

        delivered.extend(run_ids(&claims));
        harness.transport.ack(&claims[0].ticket).await.unwrap();
    }

    assert_eq!(delivered, vec![1, 2, 3]);
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_partitions_are_claimed_in_parallel() {
    let harness = TestHarness::new();
    harness.enqueue_phase(1, 1, Phase::Prepare).await.unwrap();
    harness.enqueue_phase(2, 2, Phase::Prepare).await.unwrap();
    harness.enqueue_phase(3, 1, Phase::Prepare).await.unwrap();

    let claims = harness.transport.poll().await.unwrap();
    let mut partitions: Vec<_> = claims
        .iter()
        .map(|claim| claim.ticket.queue_name.clone())
        .collect();
    partitions.sort();
    assert_eq!(partitions, vec!["env_1", "env_2"]);

    let mut ids = run_ids(&claims);
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_second_receiver_skips_locked_partition() {
    let harness = TestHarness::new();
    harness.enqueue_phase(1, 4, Phase::Prepare).await.unwrap();
    harness.enqueue_phase(2, 4, Phase::Execute).await.unwrap();

    let other = harness.second_transport();
    let first = harness.transport.poll().await.unwrap();
    assert_eq!(first.len(), 1);

    let second = other.poll().await.unwrap();
    assert!(second.is_empty());

    harness.transport.ack(&first[0].ticket).await.unwrap();
    let second = other.poll().await.unwrap();
    assert_eq!(run_ids(&second), vec![2]);
}

#[tokio::test]
async fn test_externally_held_lock_yields_no_claims() {
    let harness = TestHarness::new();
    harness.enqueue_phase(1, 3, Phase::Prepare).await.unwrap();

    let key = harness.transport.locks().key_for_environment(3);
    assert_eq!(key, "partition_processing_3");
    let foreign = harness
        .lock_service
        .try_acquire(&key, Duration::minutes(5))
        .await
        .unwrap()
        .expect("lock should be free");

    let claims = harness.transport.poll().await.unwrap();
    assert!(claims.is_empty());
    assert_eq!(harness.store.len(), 1);

    harness.lock_service.release(&foreign).await.unwrap();
    assert_eq!(harness.transport.poll().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_ack_twice_is_harmless() {
    let harness = TestHarness::new();
    harness.enqueue_phase(1, 3, Phase::Prepare).await.unwrap();

    let claims = harness.transport.poll().await.unwrap();
    let ticket = &claims[0].ticket;
    harness.transport.ack(ticket).await.unwrap();
    harness.transport.ack(ticket).await.unwrap();
    harness.transport.reject(ticket).await.unwrap();

    assert!(harness.store.is_empty());
    assert!(!harness
        .lock_service
        .is_held(&ticket.lock.key)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_stuck_message_is_redelivered_after_threshold() {
    let harness = TestHarness::new();
    let receipt = harness.enqueue_phase(1, 5, Phase::Execute).await.unwrap();

    let claims = harness.transport.poll().await.unwrap();
    assert!(!claims[0].redelivered);
    // Simulate a crashed worker: the lock goes away, the row stays delivered.
    harness.transport.abandon(&claims[0].ticket).await;

    assert!(harness.transport.poll().await.unwrap().is_empty());

    harness
        .store
        .set_delivered_at(receipt.message_id, Some(Utc::now() - Duration::hours(5)));
    let claims = harness.transport.poll().await.unwrap();
    assert_eq!(claims.len(), 1);
    assert!(claims[0].redelivered);
    assert_eq!(claims[0].ticket.message_id, receipt.message_id);
}

#[tokio::test]
async fn test_redelivery_disabled_keeps_stuck_message() {
    let harness =
        TestHarness::with_config(TransportConfig::default().with_redeliver_after_secs(None));
    let receipt = harness.enqueue_phase(1, 5, Phase::Execute).await.unwrap();

    let claims = harness.transport.poll().await.unwrap();
    harness.transport.abandon(&claims[0].ticket).await;
    harness
        .store
        .set_delivered_at(receipt.message_id, Some(Utc::now() - Duration::days(2)));

    assert!(harness.transport.poll().await.unwrap().is_empty());
    assert_eq!(harness.store.len(), 1);
}

#[tokio::test]
async fn test_heartbeat_keeps_claim_fresh() {
    let harness = TestHarness::new();
    let receipt = harness.enqueue_phase(1, 5, Phase::Execute).await.unwrap();

    let claims = harness.transport.poll().await.unwrap();
    harness
        .store
        .set_delivered_at(receipt.message_id, Some(Utc::now() - Duration::hours(5)));
    let refresher = harness.transport.refresher(&claims[0].ticket);
    refresher.refresh().await.unwrap();
    refresher.heartbeat().await.unwrap();
    harness.transport.abandon(&claims[0].ticket).await;

    assert!(harness.transport.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_refresher_reports_lost_lock() {
    let harness = TestHarness::new();
    harness.enqueue_phase(1, 5, Phase::Execute).await.unwrap();

    let claims = harness.transport.poll().await.unwrap();
    let report = clear_partition_locks(
        harness.transport.locks(),
        ClearScope::Environments(vec![5]),
        false,
    )
    .await
    .unwrap();
    assert_eq!(report.released, vec!["partition_processing_5".to_string()]);

    let refresher = harness.transport.refresher(&claims[0].ticket);
    assert!(refresher.refresh().await.is_err());
}

#[tokio::test]
async fn test_clear_dry_run_lists_without_releasing() {
    let harness = TestHarness::new();
    harness.enqueue_phase(1, 1, Phase::Prepare).await.unwrap();
    harness.enqueue_phase(2, 2, Phase::Prepare).await.unwrap();
    let claims = harness.transport.poll().await.unwrap();
    assert_eq!(claims.len(), 2);

    let report = clear_partition_locks(harness.transport.locks(), ClearScope::All, true)
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(
        report.held,
        vec![
            "partition_processing_1".to_string(),
            "partition_processing_2".to_string()
        ]
    );
    assert!(report.released.is_empty());
    assert!(harness.transport.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_undecodable_row_moves_to_failure_partition() {
    let harness = TestHarness::new();
    harness
        .store
        .insert(NewMessage {
            body: "{not json".to_string(),
            headers: r#"{"type":"run_phase"}"#.to_string(),
            queue_name: "env_9".to_string(),
            created_at: Utc::now(),
            available_at: Utc::now(),
        })
        .await
        .unwrap();

    assert!(harness.transport.poll().await.unwrap().is_empty());
    assert_eq!(harness.stored_messages("failed").len(), 1);
    assert!(harness.stored_messages("env_9").is_empty());
    // The failure partition is never consumed.
    assert!(harness.transport.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unaffine_messages_use_default_partition() {
    let harness = TestHarness::new();
    let receipt = harness
        .transport
        .bus()
        .dispatch_message(CronJobMessage { job_id: 4 }.into())
        .await
        .unwrap();
    assert_eq!(receipt.queue_name, "default");

    let claims = harness.transport.poll().await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].ticket.lock.key, "partition_processing_default");
}

#[tokio::test]
async fn test_delayed_message_waits() {
    let harness = TestHarness::new();
    let envelope = Envelope::new(RunPhaseMessage::new(1, 2, Phase::Report))
        .with(Stamp::Partition {
            queue_name: "env_2".to_string(),
        })
        .with(Stamp::Delay { millis: 60_000 });
    harness.transport.send(&envelope).await.unwrap();

    assert!(harness.transport.poll().await.unwrap().is_empty());
    let snapshot = harness.transport.snapshot().await.unwrap();
    assert_eq!(snapshot.total(), 1);
}
