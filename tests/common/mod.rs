#![allow(dead_code)]

use std::sync::Arc;

use audit_ledger::audit::{AuditEvent, AuditWriter};
use audit_ledger::config::ChainConfig;
use audit_ledger::crypto::Signer;
use audit_ledger::database::Database;
use audit_ledger::storage::{ImmutableStorage, MemoryWormStore};
use serde_json::json;

pub const RETENTION_DAYS: i64 = 2555;

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// Create a signer with a fresh key
pub fn create_test_signer() -> Arc<Signer> {
    Arc::new(Signer::generate(RETENTION_DAYS))
}

pub fn chain_config(chain_id: &str, interval: u64) -> ChainConfig {
    ChainConfig {
        chain_id: chain_id.to_string(),
        checkpoint_interval: interval,
        auto_checkpoint: true,
    }
}

/// Initialized writer on a fresh database
pub async fn setup_writer(interval: u64) -> AuditWriter {
    let writer = AuditWriter::new(setup_test_db().await, create_test_signer(), chain_config("default", interval))
        .expect("Failed to create writer");
    writer.initialize().await.expect("Failed to initialize writer");
    writer
}

/// Initialized writer exporting every checkpoint to in-memory WORM storage
pub async fn setup_writer_with_storage(interval: u64) -> (AuditWriter, Arc<ImmutableStorage>) {
    let storage = Arc::new(ImmutableStorage::new(
        Arc::new(MemoryWormStore::new()),
        RETENTION_DAYS,
    ));
    let writer = AuditWriter::new(setup_test_db().await, create_test_signer(), chain_config("default", interval))
        .expect("Failed to create writer")
        .with_storage(storage.clone(), true);
    writer.initialize().await.expect("Failed to initialize writer");
    (writer, storage)
}

pub fn sample_event(index: usize) -> AuditEvent {
    AuditEvent::new("evidence.collected", "evidence")
        .with_actor("service", "collector-1")
        .with_resource("control", format!("AC-{}", index % 7))
        .with_payload(json!({ "index": index, "result": "pass" }))
}

pub async fn record_many(writer: &AuditWriter, count: usize) {
    for i in 0..count {
        writer.record_event(sample_event(i)).await.expect("Failed to record event");
    }
}

/// Remove the immutability triggers, as a migration that rewrites history would.
pub async fn drop_immutability_triggers(db: &Database) {
    for trigger in [
        "audit_events_reject_update",
        "audit_events_reject_delete",
        "audit_checkpoints_reject_update",
        "audit_checkpoints_reject_delete",
    ] {
        sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", trigger))
            .execute(db.pool())
            .await
            .expect("Failed to drop trigger");
    }
}
