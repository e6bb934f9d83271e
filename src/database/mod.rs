pub mod models;
pub mod queries;
pub mod schema;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::LedgerError;

pub use models::CheckpointExport;
pub use queries::{EventTotals, Queries};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and bring the schema up to date.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await?;

        info!("Connected to audit database {}", config.url);
        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires
    /// holds the data for the lifetime of the pool.
    pub async fn new_in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        for (name, sql) in schema::MIGRATIONS {
            sqlx::raw_sql(*sql).execute(&self.pool).await?;
            debug!("Applied migration {}", name);
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{link_event, AuditEvent, ChainHead};
    use serde_json::json;

    async fn seeded() -> Database {
        let db = Database::new_in_memory().await.unwrap();
        let mut head = ChainHead::genesis();
        for i in 0..3 {
            let event = AuditEvent::new("test.event", "test").with_payload(json!({"i": i}));
            let record = link_event(
                "default",
                &head,
                event,
                uuid::Uuid::new_v4().to_string(),
                crate::audit::entry::now_micros(),
            );
            Queries::insert_event(db.pool(), &record).await.unwrap();
            head = record.head();
        }
        db
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_event() {
        let db = seeded().await;
        let head = Queries::get_chain_head(db.pool(), "default").await.unwrap().unwrap();
        assert_eq!(head.sequence_number, 3);

        let event = Queries::get_event(db.pool(), "default", 2).await.unwrap().unwrap();
        assert!(event.verify_hash());
        assert_eq!(event.payload, json!({"i": 1}));

        assert!(Queries::get_chain_head(db.pool(), "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_rejected() {
        let db = seeded().await;
        let err = sqlx::query("DELETE FROM audit_events WHERE sequence_number = 2")
            .execute(db.pool())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("append-only"));
    }

    #[tokio::test]
    async fn test_payload_update_rejected() {
        let db = seeded().await;
        let err = sqlx::query("UPDATE audit_events SET payload = '{}' WHERE sequence_number = 1")
            .execute(db.pool())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("append-only"));
    }

    #[tokio::test]
    async fn test_duplicate_link_rejected() {
        let db = seeded().await;
        let first = Queries::get_event(db.pool(), "default", 1).await.unwrap().unwrap();
        let mut fork = first.clone();
        fork.id = uuid::Uuid::new_v4().to_string();
        fork.sequence_number = 4;
        assert!(Queries::insert_event(db.pool(), &fork).await.is_err());
    }

    #[tokio::test]
    async fn test_event_totals() {
        let db = seeded().await;
        let totals = Queries::get_event_totals(db.pool(), "default").await.unwrap();
        assert_eq!(totals.count, 3);
        assert!(totals.first_timestamp.unwrap() <= totals.last_timestamp.unwrap());

        let empty = Queries::get_event_totals(db.pool(), "other").await.unwrap();
        assert_eq!(empty.count, 0);
        assert!(empty.first_timestamp.is_none());
    }
}
