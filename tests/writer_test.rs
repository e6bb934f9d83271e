//! Audit writer tests against an in-memory database

mod common;
use common::*;

use audit_ledger::audit::{AuditEvent, AuditWriter};
use audit_ledger::crypto::KeyStatus;
use audit_ledger::database::Queries;
use audit_ledger::LedgerError;
use serde_json::json;

#[tokio::test]
async fn test_auto_checkpoint_at_interval_boundaries() {
    let writer = setup_writer(1000).await;

    for chunk in 0..25 {
        let events = (chunk * 100..(chunk + 1) * 100).map(sample_event).collect();
        writer.record_events(events).await.unwrap();
    }

    let stats = writer.get_stats().await.unwrap();
    assert_eq!(stats.total_events, 2500);
    assert_eq!(stats.total_checkpoints, 2);
    assert_eq!(stats.pending_events, 500);

    let checkpoints = Queries::list_checkpoints(writer.database().pool(), "default")
        .await
        .unwrap();
    let ranges: Vec<(u64, u64)> = checkpoints
        .iter()
        .map(|cp| (cp.data.first_sequence_number, cp.data.last_sequence_number))
        .collect();
    assert_eq!(ranges, vec![(1, 1000), (1001, 2000)]);
    assert_eq!(checkpoints[1].data.previous_checkpoint_id.as_deref(), Some(checkpoints[0].id.as_str()));
    assert_eq!(
        checkpoints[1].data.previous_merkle_root.as_deref(),
        Some(checkpoints[0].data.merkle_root.as_str())
    );

    // explicit checkpoint seals the remainder
    let last = writer.create_checkpoint().await.unwrap();
    assert_eq!(last.data.checkpoint_number, 3);
    assert_eq!(last.data.first_sequence_number, 2001);
    assert_eq!(last.data.last_sequence_number, 2500);
    assert_eq!(last.data.event_count, 500);
    assert_eq!(writer.get_stats().await.unwrap().pending_events, 0);

    let results = writer.verify_all_checkpoints().await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.is_valid), "{:?}", results);
}

#[tokio::test]
async fn test_verify_clean_chain() {
    let writer = setup_writer(1000).await;
    record_many(&writer, 25).await;

    let result = writer.verify_chain(None, None).await.unwrap();
    assert!(result.is_valid);
    assert_eq!(result.validated_count, 25);
    assert!(result.invalid_at_sequence.is_none());
    assert!(result.breaks.is_empty());

    // a sub-range is anchored to the record before it
    let partial = writer.verify_chain(Some(10), Some(20)).await.unwrap();
    assert!(partial.is_valid);
    assert_eq!(partial.validated_count, 11);
}

#[tokio::test]
async fn test_payload_tamper_is_located() {
    let writer = setup_writer(1000).await;
    record_many(&writer, 10).await;
    drop_immutability_triggers(writer.database()).await;

    sqlx::query("UPDATE audit_events SET payload = ? WHERE chain_id = ? AND sequence_number = ?")
        .bind(json!({ "index": 4, "result": "fail" }).to_string())
        .bind("default")
        .bind(5_i64)
        .execute(writer.database().pool())
        .await
        .unwrap();

    let result = writer.verify_chain(None, None).await.unwrap();
    assert!(!result.is_valid);
    assert_eq!(result.invalid_at_sequence, Some(5));
    assert_eq!(result.validated_count, 4);
    assert!(result.error.unwrap().contains("sequence 5"));
}

#[tokio::test]
async fn test_deleted_event_is_detected() {
    let writer = setup_writer(1000).await;
    record_many(&writer, 10).await;
    drop_immutability_triggers(writer.database()).await;

    sqlx::query("DELETE FROM audit_events WHERE chain_id = ? AND sequence_number = ?")
        .bind("default")
        .bind(7_i64)
        .execute(writer.database().pool())
        .await
        .unwrap();

    let result = writer.verify_chain(None, None).await.unwrap();
    assert!(!result.is_valid);
    assert!(result.validated_count <= 7);
    assert_eq!(result.invalid_at_sequence, Some(8));
}

#[tokio::test]
async fn test_sealed_rows_reject_modification() {
    let writer = setup_writer(5).await;
    record_many(&writer, 5).await;
    let pool = writer.database().pool();

    let update = sqlx::query("UPDATE audit_events SET payload = '{}' WHERE sequence_number = 1")
        .execute(pool)
        .await;
    assert!(update.unwrap_err().to_string().contains("append-only"));

    let delete = sqlx::query("DELETE FROM audit_events WHERE sequence_number = 1")
        .execute(pool)
        .await;
    assert!(delete.is_err());

    let restamp = sqlx::query("UPDATE audit_events SET merkle_leaf_index = 3 WHERE sequence_number = 1")
        .execute(pool)
        .await;
    assert!(restamp.is_err());

    let checkpoint_update = sqlx::query("UPDATE audit_checkpoints SET merkle_root = ?")
        .bind("00".repeat(32))
        .execute(pool)
        .await;
    assert!(checkpoint_update.is_err());

    let checkpoint_delete = sqlx::query("DELETE FROM audit_checkpoints").execute(pool).await;
    assert!(checkpoint_delete.is_err());

    assert!(writer.verify_chain(None, None).await.unwrap().is_valid);
}

#[tokio::test]
async fn test_verify_checkpoint_detects_root_tamper() {
    let writer = setup_writer(8).await;
    record_many(&writer, 8).await;
    assert!(writer.verify_checkpoint(1).await.unwrap().is_valid);

    drop_immutability_triggers(writer.database()).await;
    sqlx::query("UPDATE audit_checkpoints SET merkle_root = ? WHERE checkpoint_number = 1")
        .bind("ab".repeat(32))
        .execute(writer.database().pool())
        .await
        .unwrap();

    let result = writer.verify_checkpoint(1).await.unwrap();
    assert!(!result.is_valid);
    assert!(!result.root_matches);
    assert!(!result.signature.is_valid());
    assert!(result.event_count_matches);
}

#[tokio::test]
async fn test_event_proof_round_trip() {
    let writer = setup_writer(1000).await;
    record_many(&writer, 13).await;

    // unsealed events have no proof yet
    assert!(matches!(
        writer.get_event_proof(6).await,
        Err(LedgerError::NotFound(_))
    ));

    writer.create_checkpoint().await.unwrap();
    let proof = writer.get_event_proof(6).await.unwrap();
    assert_eq!(proof.proof.leaf_index, 5);
    assert_eq!(proof.event.merkle_leaf_index, Some(5));
    assert!(writer.verify_event_proof(&proof).await);

    let mut forged = proof.clone();
    forged.event.payload = json!({ "index": 5, "result": "fail" });
    assert!(!writer.verify_event_proof(&forged).await);
}

#[tokio::test]
async fn test_rotation_keeps_history_verifiable() {
    let writer = setup_writer(4).await;
    record_many(&writer, 4).await;

    let old_key = writer.signer().active_key_id().await.unwrap();
    let new_key = writer.rotate_signing_key().await.unwrap();
    assert_ne!(old_key, new_key);

    record_many(&writer, 4).await;

    let checkpoints = Queries::list_checkpoints(writer.database().pool(), "default")
        .await
        .unwrap();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].signature.key_id, old_key);
    assert_eq!(checkpoints[1].signature.key_id, new_key);
    assert!(writer.verify_all_checkpoints().await.unwrap().iter().all(|r| r.is_valid));

    let keys = Queries::list_signing_keys(writer.database().pool()).await.unwrap();
    let now = chrono::Utc::now();
    let retired = keys.iter().find(|k| k.key_id == old_key).unwrap();
    let active = keys.iter().find(|k| k.key_id == new_key).unwrap();
    assert_eq!(retired.status_at(now), KeyStatus::Retired);
    assert!(retired.rotated_at.is_some());
    assert!(retired.expires_at.is_some());
    assert_eq!(active.status_at(now), KeyStatus::Active);
}

#[tokio::test]
async fn test_reinitialize_continues_sequence() {
    let writer = setup_writer(1000).await;
    record_many(&writer, 3).await;
    let head = writer.head().await;

    let reopened = AuditWriter::new(
        writer.database().clone(),
        writer.signer().clone(),
        chain_config("default", 1000),
    )
    .unwrap();
    assert_eq!(reopened.initialize().await.unwrap(), head);

    let next = reopened.record_event(sample_event(3)).await.unwrap();
    assert_eq!(next.sequence_number, 4);
    assert_eq!(next.previous_hash, head.event_hash);
    assert!(reopened.verify_chain(None, None).await.unwrap().is_valid);
}

#[tokio::test]
async fn test_chains_are_independent() {
    let writer = setup_writer(1000).await;
    let tenant = AuditWriter::new(
        writer.database().clone(),
        create_test_signer(),
        chain_config("tenant-b", 2),
    )
    .unwrap();
    tenant.initialize().await.unwrap();

    record_many(&writer, 3).await;
    let first = tenant.record_event(sample_event(0)).await.unwrap();
    tenant.record_event(sample_event(1)).await.unwrap();

    assert_eq!(first.sequence_number, 1);
    assert_eq!(first.chain_id, "tenant-b");
    assert_eq!(writer.get_stats().await.unwrap().total_checkpoints, 0);
    assert_eq!(tenant.get_stats().await.unwrap().total_checkpoints, 1);
    assert!(writer.verify_chain(None, None).await.unwrap().is_valid);
    assert!(tenant.verify_chain(None, None).await.unwrap().is_valid);
}

#[tokio::test]
async fn test_failed_auto_checkpoint_is_reported() {
    let writer = setup_writer(4).await;
    sqlx::query(
        "CREATE TRIGGER reject_checkpoints BEFORE INSERT ON audit_checkpoints \
         BEGIN SELECT RAISE(ABORT, 'checkpoint store unavailable'); END",
    )
    .execute(writer.database().pool())
    .await
    .unwrap();

    let err = writer
        .record_events((0..4).map(sample_event).collect())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::CheckpointFailed { committed_through: 4, .. }
    ));
    assert!(!err.is_integrity_failure());

    // the events stay committed and unsealed
    let stats = writer.get_stats().await.unwrap();
    assert_eq!(stats.total_events, 4);
    assert_eq!(stats.total_checkpoints, 0);
    assert_eq!(stats.pending_events, 4);

    sqlx::query("DROP TRIGGER reject_checkpoints")
        .execute(writer.database().pool())
        .await
        .unwrap();

    // the next write seals the overdue interval
    let next = writer.record_event(sample_event(4)).await.unwrap();
    assert_eq!(next.sequence_number, 5);
    let stats = writer.get_stats().await.unwrap();
    assert_eq!(stats.total_checkpoints, 1);
    assert_eq!(stats.pending_events, 1);
}

#[tokio::test]
async fn test_failed_batch_leaves_head_untouched() {
    let writer = setup_writer(1000).await;
    record_many(&writer, 2).await;
    let head = writer.head().await;

    sqlx::query(
        "CREATE TRIGGER reject_rejected_type BEFORE INSERT ON audit_events \
         WHEN NEW.event_type = 'ingest.rejected' \
         BEGIN SELECT RAISE(ABORT, 'event type not accepted'); END",
    )
    .execute(writer.database().pool())
    .await
    .unwrap();

    let batch = vec![
        sample_event(2),
        AuditEvent::new("ingest.rejected", "ingest"),
    ];
    assert!(writer.record_events(batch).await.is_err());

    // nothing from the batch was kept
    assert_eq!(writer.head().await, head);
    assert_eq!(writer.get_stats().await.unwrap().total_events, 2);

    let next = writer.record_event(sample_event(3)).await.unwrap();
    assert_eq!(next.sequence_number, 3);
    assert_eq!(next.previous_hash, head.event_hash);

    let result = writer.verify_chain(None, None).await.unwrap();
    assert!(result.is_valid);
    assert_eq!(result.validated_count, 3);
}

#[tokio::test]
async fn test_proof_rejects_mismatched_stamp() {
    let writer = setup_writer(4).await;
    record_many(&writer, 8).await;

    let second = Queries::get_checkpoint_by_number(writer.database().pool(), "default", 2)
        .await
        .unwrap()
        .unwrap();
    drop_immutability_triggers(writer.database()).await;
    sqlx::query("UPDATE audit_events SET checkpoint_id = ? WHERE chain_id = ? AND sequence_number = ?")
        .bind(&second.id)
        .bind("default")
        .bind(2_i64)
        .execute(writer.database().pool())
        .await
        .unwrap();

    let err = writer.get_event_proof(2).await.unwrap_err();
    assert!(err.is_integrity_failure());
}
