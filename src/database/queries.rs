use sqlx::{Executor, Sqlite};

use crate::audit::checkpoint::Checkpoint;
use crate::audit::entry::{canonical_json, canonical_timestamp, parse_timestamp, ChainHead, RecordedEvent};
use crate::crypto::SigningKeyRecord;
use crate::database::models::*;
use crate::error::LedgerError;

const EVENT_COLUMNS: &str = "id, chain_id, sequence_number, timestamp, event_type, category, \
     actor_id, actor_type, resource_type, resource_id, payload, previous_hash, event_hash, \
     checkpoint_id, merkle_leaf_index";

const CHECKPOINT_COLUMNS: &str = "id, chain_id, checkpoint_number, period_start, period_end, \
     first_sequence_number, last_sequence_number, event_count, merkle_root, signature, key_id, \
     algorithm, signed_at, previous_checkpoint_id, previous_merkle_root, created_at";

/// Counts and time bounds of one chain.
#[derive(Debug, Clone, Default)]
pub struct EventTotals {
    pub count: u64,
    pub first_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub last_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct Queries;

impl Queries {
    pub async fn insert_event<'e, E>(executor: E, event: &RecordedEvent) -> Result<(), LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, chain_id, sequence_number, timestamp, event_type, category,
                actor_id, actor_type, resource_type, resource_id, payload,
                previous_hash, event_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.chain_id)
        .bind(to_db_int(event.sequence_number)?)
        .bind(canonical_timestamp(&event.timestamp))
        .bind(&event.event_type)
        .bind(&event.category)
        .bind(&event.actor_id)
        .bind(&event.actor_type)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(canonical_json(&event.payload))
        .bind(&event.previous_hash)
        .bind(&event.event_hash)
        .execute(executor)
        .await
        .map_err(|e| {
            // another writer already extended the chain from the same head
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return LedgerError::chain_integrity(
                        event.sequence_number,
                        format!(
                            "Sequence {} or its predecessor link is already recorded",
                            event.sequence_number
                        ),
                    );
                }
            }
            LedgerError::from(e)
        })?;

        Ok(())
    }

    pub async fn get_chain_head<'e, E>(
        executor: E,
        chain_id: &str,
    ) -> Result<Option<ChainHead>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT sequence_number, event_hash
            FROM audit_events
            WHERE chain_id = ?
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .bind(chain_id)
        .fetch_optional(executor)
        .await?;

        row.map(|(sequence_number, event_hash)| {
            Ok(ChainHead {
                sequence_number: from_db_int(sequence_number, "sequence_number")?,
                event_hash,
            })
        })
        .transpose()
    }

    pub async fn get_event<'e, E>(
        executor: E,
        chain_id: &str,
        sequence_number: u64,
    ) -> Result<Option<RecordedEvent>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM audit_events WHERE chain_id = ? AND sequence_number = ?",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(chain_id)
            .bind(to_db_int(sequence_number)?)
            .fetch_optional(executor)
            .await?
            .map(RecordedEvent::try_from)
            .transpose()
    }

    /// Events with `first <= sequence_number <= last`, in sequence order.
    pub async fn get_events_range<'e, E>(
        executor: E,
        chain_id: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<RecordedEvent>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM audit_events \
             WHERE chain_id = ? AND sequence_number BETWEEN ? AND ? \
             ORDER BY sequence_number ASC",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(chain_id)
            .bind(to_db_int(first)?)
            .bind(to_db_int(last)?)
            .fetch_all(executor)
            .await?
            .into_iter()
            .map(RecordedEvent::try_from)
            .collect()
    }

    pub async fn get_event_totals<'e, E>(
        executor: E,
        chain_id: &str,
    ) -> Result<EventTotals, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (count, first, last): (i64, Option<String>, Option<String>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(timestamp), MAX(timestamp)
            FROM audit_events
            WHERE chain_id = ?
            "#,
        )
        .bind(chain_id)
        .fetch_one(executor)
        .await?;

        Ok(EventTotals {
            count: from_db_int(count, "count")?,
            first_timestamp: first.as_deref().map(parse_timestamp).transpose()?,
            last_timestamp: last.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    /// Stamp the events of a new checkpoint with their leaf positions.
    /// Only rows not yet sealed are touched; returns the number stamped.
    pub async fn stamp_checkpoint_events<'e, E>(
        executor: E,
        chain_id: &str,
        checkpoint_id: &str,
        first: u64,
        last: u64,
    ) -> Result<u64, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE audit_events
            SET checkpoint_id = ?, merkle_leaf_index = sequence_number - ?
            WHERE chain_id = ?
              AND sequence_number BETWEEN ? AND ?
              AND checkpoint_id IS NULL
            "#,
        )
        .bind(checkpoint_id)
        .bind(to_db_int(first)?)
        .bind(chain_id)
        .bind(to_db_int(first)?)
        .bind(to_db_int(last)?)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn insert_checkpoint<'e, E>(
        executor: E,
        checkpoint: &Checkpoint,
    ) -> Result<(), LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let data = &checkpoint.data;
        sqlx::query(
            r#"
            INSERT INTO audit_checkpoints (
                id, chain_id, checkpoint_number, period_start, period_end,
                first_sequence_number, last_sequence_number, event_count, merkle_root,
                signature, key_id, algorithm, signed_at,
                previous_checkpoint_id, previous_merkle_root, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.id)
        .bind(&data.chain_id)
        .bind(to_db_int(data.checkpoint_number)?)
        .bind(canonical_timestamp(&data.period_start))
        .bind(canonical_timestamp(&data.period_end))
        .bind(to_db_int(data.first_sequence_number)?)
        .bind(to_db_int(data.last_sequence_number)?)
        .bind(to_db_int(data.event_count)?)
        .bind(&data.merkle_root)
        .bind(&checkpoint.signature.signature)
        .bind(&checkpoint.signature.key_id)
        .bind(&checkpoint.signature.algorithm)
        .bind(canonical_timestamp(&checkpoint.signature.signed_at))
        .bind(&data.previous_checkpoint_id)
        .bind(&data.previous_merkle_root)
        .bind(canonical_timestamp(&checkpoint.created_at))
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn get_latest_checkpoint<'e, E>(
        executor: E,
        chain_id: &str,
    ) -> Result<Option<Checkpoint>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM audit_checkpoints WHERE chain_id = ? \
             ORDER BY checkpoint_number DESC LIMIT 1",
            CHECKPOINT_COLUMNS
        );
        sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(chain_id)
            .fetch_optional(executor)
            .await?
            .map(Checkpoint::try_from)
            .transpose()
    }

    pub async fn get_checkpoint_by_number<'e, E>(
        executor: E,
        chain_id: &str,
        checkpoint_number: u64,
    ) -> Result<Option<Checkpoint>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM audit_checkpoints WHERE chain_id = ? AND checkpoint_number = ?",
            CHECKPOINT_COLUMNS
        );
        sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(chain_id)
            .bind(to_db_int(checkpoint_number)?)
            .fetch_optional(executor)
            .await?
            .map(Checkpoint::try_from)
            .transpose()
    }

    pub async fn get_checkpoint_by_id<'e, E>(
        executor: E,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {} FROM audit_checkpoints WHERE id = ?", CHECKPOINT_COLUMNS);
        sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(checkpoint_id)
            .fetch_optional(executor)
            .await?
            .map(Checkpoint::try_from)
            .transpose()
    }

    pub async fn list_checkpoints<'e, E>(
        executor: E,
        chain_id: &str,
    ) -> Result<Vec<Checkpoint>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM audit_checkpoints WHERE chain_id = ? ORDER BY checkpoint_number ASC",
            CHECKPOINT_COLUMNS
        );
        sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(chain_id)
            .fetch_all(executor)
            .await?
            .into_iter()
            .map(Checkpoint::try_from)
            .collect()
    }

    pub async fn count_checkpoints<'e, E>(executor: E, chain_id: &str) -> Result<u64, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audit_checkpoints WHERE chain_id = ?")
                .bind(chain_id)
                .fetch_one(executor)
                .await?;
        from_db_int(count, "count")
    }

    /// Insert a key record unless one with the same id already exists.
    pub async fn insert_signing_key<'e, E>(
        executor: E,
        key: &SigningKeyRecord,
    ) -> Result<bool, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO signing_keys (key_id, algorithm, public_key, created_at, rotated_at, expires_at, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key_id) DO NOTHING
            "#,
        )
        .bind(&key.key_id)
        .bind(&key.algorithm)
        .bind(&key.public_key)
        .bind(canonical_timestamp(&key.created_at))
        .bind(key.rotated_at.as_ref().map(canonical_timestamp))
        .bind(key.expires_at.as_ref().map(canonical_timestamp))
        .bind(key.active)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a rotation. Only an unrotated key can be retired.
    pub async fn retire_signing_key<'e, E>(
        executor: E,
        key: &SigningKeyRecord,
    ) -> Result<(), LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (Some(rotated_at), Some(expires_at)) = (key.rotated_at, key.expires_at) else {
            return Err(LedgerError::Signing(format!(
                "Key {} has no rotation timestamps",
                key.key_id
            )));
        };

        let result = sqlx::query(
            r#"
            UPDATE signing_keys
            SET active = 0, rotated_at = ?, expires_at = ?
            WHERE key_id = ? AND rotated_at IS NULL
            "#,
        )
        .bind(canonical_timestamp(&rotated_at))
        .bind(canonical_timestamp(&expires_at))
        .bind(&key.key_id)
        .execute(executor)
        .await?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::NotFound(format!(
                "Active signing key {}",
                key.key_id
            )));
        }
        Ok(())
    }

    pub async fn list_signing_keys<'e, E>(executor: E) -> Result<Vec<SigningKeyRecord>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, SigningKeyRow>(
            r#"
            SELECT key_id, algorithm, public_key, created_at, rotated_at, expires_at, active
            FROM signing_keys
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(SigningKeyRecord::try_from)
        .collect()
    }

    pub async fn insert_export<'e, E>(
        executor: E,
        export: &CheckpointExport,
    ) -> Result<(), LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO checkpoint_exports (
                checkpoint_id, storage_key, version_id, content_hash, retain_until, exported_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&export.checkpoint_id)
        .bind(&export.storage_key)
        .bind(&export.version_id)
        .bind(&export.content_hash)
        .bind(canonical_timestamp(&export.retain_until))
        .bind(canonical_timestamp(&export.exported_at))
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn list_exports<'e, E>(
        executor: E,
        checkpoint_id: &str,
    ) -> Result<Vec<CheckpointExport>, LedgerError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, ExportRow>(
            r#"
            SELECT checkpoint_id, storage_key, version_id, content_hash, retain_until, exported_at
            FROM checkpoint_exports
            WHERE checkpoint_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(checkpoint_id)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(CheckpointExport::try_from)
        .collect()
    }
}
