//! Audit Writer
//!
//! Appends events to the persisted hash chain, seals them into signed
//! Merkle checkpoints and exports checkpoint bundles to WORM storage.
//!
//! The writer caches the chain head. Every write re-reads the persisted head
//! inside its transaction and refuses to continue when the two disagree;
//! recording stays halted until [`AuditWriter::resynchronize`] is called.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::audit::checkpoint::{Checkpoint, CheckpointBundle, CheckpointData, EXPORT_VERSION};
use crate::audit::entry::{link_event, now_micros, AuditEvent, ChainHead, RecordedEvent};
use crate::audit::merkle::{verify_proof, MerkleProof, MerkleTree};
use crate::audit::verify::{find_chain_breaks, validate_chain_from, BreakKind, ChainBreak};
use crate::config::{ChainConfig, LedgerConfig};
use crate::crypto::{hashes_equal, KeyStore, Signer, VerificationOutcome};
use crate::database::{CheckpointExport, Database, Queries};
use crate::error::LedgerError;
use crate::storage::{ImmutableStorage, StorageError, StoredObject};

/// Records fetched per query when verifying long ranges.
const VERIFY_BATCH_SIZE: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterPhase {
    Uninitialized,
    /// Head loaded from persistence.
    Initialized,
    /// Signing keys registered; writes accepted.
    Ready,
}

struct WriterState {
    phase: WriterPhase,
    head: ChainHead,
    /// Set when the cached head can no longer be trusted.
    halted: Option<String>,
}

/// Result of re-verifying the persisted chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub is_valid: bool,
    /// Records that verified before the first break.
    pub validated_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub breaks: Vec<ChainBreak>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub chain_id: String,
    pub total_events: u64,
    pub total_checkpoints: u64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_checkpoint_number: Option<u64>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub pending_events: u64,
    pub head: ChainHead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointVerification {
    pub checkpoint_number: u64,
    pub checkpoint_id: String,
    pub is_valid: bool,
    pub root_matches: bool,
    pub event_count_matches: bool,
    pub linkage_valid: bool,
    pub signature: VerificationOutcome,
    pub issues: Vec<String>,
}

/// An event with everything needed to prove its membership in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventProof {
    pub event: RecordedEvent,
    pub checkpoint: Checkpoint,
    pub proof: MerkleProof,
}

pub struct AuditWriter {
    db: Database,
    signer: Arc<Signer>,
    storage: Option<Arc<ImmutableStorage>>,
    config: ChainConfig,
    export_on_checkpoint: bool,
    state: Mutex<WriterState>,
}

impl AuditWriter {
    pub fn new(db: Database, signer: Arc<Signer>, config: ChainConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self {
            db,
            signer,
            storage: None,
            config,
            export_on_checkpoint: false,
            state: Mutex::new(WriterState {
                phase: WriterPhase::Uninitialized,
                head: ChainHead::genesis(),
                halted: None,
            }),
        })
    }

    /// Attach WORM storage. With `export_on_checkpoint`, every new
    /// checkpoint is exported right after it commits.
    pub fn with_storage(mut self, storage: Arc<ImmutableStorage>, export_on_checkpoint: bool) -> Self {
        self.storage = Some(storage);
        self.export_on_checkpoint = export_on_checkpoint;
        self
    }

    /// Build a writer from configuration: database, key store and storage.
    pub async fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let db = Database::new(&config.database).await?;
        let signer = Signer::from_key_store(
            KeyStore::new(&config.signing.key_dir),
            config.signing.key_retention_days,
        )?;

        let writer = Self::new(db, Arc::new(signer), config.chain.clone())?;
        if !config.storage.enabled {
            return Ok(writer);
        }

        let storage = ImmutableStorage::from_config(&config.storage)?;
        info!("WORM export enabled ({} backend)", storage.backend_name());
        Ok(writer.with_storage(Arc::new(storage), config.storage.export_on_checkpoint))
    }

    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    pub fn storage(&self) -> Option<&Arc<ImmutableStorage>> {
        self.storage.as_ref()
    }

    pub async fn phase(&self) -> WriterPhase {
        self.state.lock().await.phase
    }

    /// Cached head; the persisted head is authoritative.
    pub async fn head(&self) -> ChainHead {
        self.state.lock().await.head.clone()
    }

    /// Load the chain head and register signing keys with persistence.
    pub async fn initialize(&self) -> Result<ChainHead, LedgerError> {
        let mut state = self.state.lock().await;

        let head = Queries::get_chain_head(self.db.pool(), &self.config.chain_id)
            .await?
            .unwrap_or_else(ChainHead::genesis);
        state.head = head.clone();
        state.halted = None;
        state.phase = WriterPhase::Initialized;
        debug!(
            "Chain {} head loaded at sequence {}",
            self.config.chain_id, head.sequence_number
        );

        self.register_keys().await?;
        state.phase = WriterPhase::Ready;

        info!(
            "Audit writer ready for chain {} at sequence {}",
            self.config.chain_id, head.sequence_number
        );
        Ok(head)
    }

    async fn register_keys(&self) -> Result<(), LedgerError> {
        for record in self.signer.key_records().await {
            if Queries::insert_signing_key(self.db.pool(), &record).await? {
                info!("Registered signing key {}", record.key_id);
            }
        }
        // persisted lifecycle covers keys retired by earlier processes
        for record in Queries::list_signing_keys(self.db.pool()).await? {
            self.signer.import_key_record(record).await?;
        }
        Ok(())
    }

    fn ensure_ready(state: &WriterState) -> Result<(), LedgerError> {
        if state.phase != WriterPhase::Ready {
            return Err(LedgerError::NotInitialized(format!(
                "writer is {:?}, call initialize() first",
                state.phase
            )));
        }
        if let Some(reason) = &state.halted {
            return Err(LedgerError::chain_integrity(
                state.head.sequence_number,
                format!("recording halted until resynchronized: {}", reason),
            ));
        }
        Ok(())
    }

    /// Append one event to the chain.
    pub async fn record_event(&self, event: AuditEvent) -> Result<RecordedEvent, LedgerError> {
        let mut state = self.state.lock().await;
        Self::ensure_ready(&state)?;

        let mut records = self.append(&mut state, vec![event]).await?;
        self.auto_checkpoint(&mut state).await?;
        records
            .pop()
            .ok_or_else(|| LedgerError::Database("Insert returned no record".to_string()))
    }

    /// Append a batch atomically: either every event is recorded or none.
    pub async fn record_events(
        &self,
        events: Vec<AuditEvent>,
    ) -> Result<Vec<RecordedEvent>, LedgerError> {
        let mut state = self.state.lock().await;
        Self::ensure_ready(&state)?;

        let records = self.append(&mut state, events).await?;
        self.auto_checkpoint(&mut state).await?;
        Ok(records)
    }

    async fn append(
        &self,
        state: &mut WriterState,
        events: Vec<AuditEvent>,
    ) -> Result<Vec<RecordedEvent>, LedgerError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let chain_id = &self.config.chain_id;
        let mut tx = self.db.pool().begin().await?;

        let persisted = Queries::get_chain_head(&mut *tx, chain_id)
            .await?
            .unwrap_or_else(ChainHead::genesis);
        if persisted.sequence_number != state.head.sequence_number
            || !hashes_equal(&persisted.event_hash, &state.head.event_hash)
        {
            let reason = format!(
                "persisted head is sequence {} ({}), writer expected {} ({})",
                persisted.sequence_number,
                persisted.event_hash,
                state.head.sequence_number,
                state.head.event_hash
            );
            error!("Chain {} desynchronized: {}", chain_id, reason);
            state.halted = Some(reason.clone());
            return Err(LedgerError::chain_integrity(persisted.sequence_number, reason));
        }

        let mut head = state.head.clone();
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let record = link_event(
                chain_id,
                &head,
                event,
                uuid::Uuid::new_v4().to_string(),
                now_micros(),
            );
            if let Err(e) = Queries::insert_event(&mut *tx, &record).await {
                if e.is_integrity_failure() {
                    state.halted = Some(e.to_string());
                }
                return Err(e);
            }
            head = record.head();
            records.push(record);
        }

        tx.commit().await?;
        state.head = head;

        debug!(
            "Recorded {} event(s) on chain {}, head at {}",
            records.len(),
            chain_id,
            state.head.sequence_number
        );
        Ok(records)
    }

    /// Seal full intervals of pending events. The triggering events are
    /// already committed, so a failure is reported as `CheckpointFailed`
    /// rather than as a failed write.
    async fn auto_checkpoint(&self, state: &mut WriterState) -> Result<(), LedgerError> {
        if !self.config.auto_checkpoint {
            return Ok(());
        }

        let interval = self.config.checkpoint_interval;
        let committed_through = state.head.sequence_number;
        loop {
            let next_first = self.next_checkpoint_start().await.map_err(|e| {
                error!("Failed to read checkpoint state: {}", e);
                LedgerError::CheckpointFailed {
                    committed_through,
                    message: e.to_string(),
                }
            })?;
            if committed_through + 1 < next_first + interval {
                return Ok(());
            }

            let last = next_first + interval - 1;
            if let Err(e) = self.create_checkpoint_range(state, next_first, last).await {
                error!(
                    "Automatic checkpoint of {}..{} failed: {}",
                    next_first, last, e
                );
                if e.is_integrity_failure() {
                    state.halted = Some(e.to_string());
                }
                return Err(LedgerError::CheckpointFailed {
                    committed_through,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn next_checkpoint_start(&self) -> Result<u64, LedgerError> {
        Ok(
            Queries::get_latest_checkpoint(self.db.pool(), &self.config.chain_id)
                .await?
                .map(|cp| cp.data.last_sequence_number + 1)
                .unwrap_or(1),
        )
    }

    /// Seal every event recorded since the last checkpoint.
    pub async fn create_checkpoint(&self) -> Result<Checkpoint, LedgerError> {
        let mut state = self.state.lock().await;
        Self::ensure_ready(&state)?;

        let first = self.next_checkpoint_start().await?;
        let last = state.head.sequence_number;
        if last < first {
            return Err(LedgerError::NothingToCheckpoint);
        }
        self.create_checkpoint_range(&mut state, first, last).await
    }

    async fn create_checkpoint_range(
        &self,
        state: &mut WriterState,
        first: u64,
        last: u64,
    ) -> Result<Checkpoint, LedgerError> {
        if last > state.head.sequence_number {
            return Err(LedgerError::chain_integrity(
                last,
                format!("checkpoint end {} is beyond the head", last),
            ));
        }

        let chain_id = &self.config.chain_id;
        let mut tx = self.db.pool().begin().await?;

        let previous = Queries::get_latest_checkpoint(&mut *tx, chain_id).await?;
        let expected_first = previous
            .as_ref()
            .map(|cp| cp.data.last_sequence_number + 1)
            .unwrap_or(1);
        if first != expected_first {
            return Err(LedgerError::chain_integrity(
                first,
                format!("checkpoint must start at {}, not {}", expected_first, first),
            ));
        }

        let events = Queries::get_events_range(&mut *tx, chain_id, first, last).await?;
        let (Some(first_event), Some(last_event)) = (events.first(), events.last()) else {
            return Err(LedgerError::NothingToCheckpoint);
        };
        let expected_count = last - first + 1;
        if events.len() as u64 != expected_count {
            return Err(LedgerError::chain_integrity(
                first,
                format!(
                    "expected {} events in {}..{}, found {}",
                    expected_count,
                    first,
                    last,
                    events.len()
                ),
            ));
        }

        let anchor = if first == 1 {
            ChainHead::genesis()
        } else {
            Queries::get_event(&mut *tx, chain_id, first - 1)
                .await?
                .map(|e| e.head())
                .ok_or_else(|| {
                    LedgerError::chain_integrity(first - 1, "predecessor of checkpoint range is missing")
                })?
        };
        let validation = validate_chain_from(&events, Some(&anchor));
        if !validation.is_valid {
            return Err(LedgerError::chain_integrity(
                validation.invalid_at_sequence.unwrap_or(first),
                format!("refusing to checkpoint a broken chain: {:?}", validation.reason),
            ));
        }

        let leaves: Vec<String> = events.iter().map(|e| e.event_hash.clone()).collect();
        let tree = MerkleTree::build(&leaves)?;

        let data = CheckpointData {
            chain_id: chain_id.clone(),
            checkpoint_number: previous
                .as_ref()
                .map(|cp| cp.data.checkpoint_number + 1)
                .unwrap_or(1),
            period_start: first_event.timestamp,
            period_end: last_event.timestamp,
            first_sequence_number: first,
            last_sequence_number: last,
            event_count: expected_count,
            merkle_root: tree.root(),
            previous_checkpoint_id: previous.as_ref().map(|cp| cp.id.clone()),
            previous_merkle_root: previous.as_ref().map(|cp| cp.data.merkle_root.clone()),
        };
        data.validate_range()?;

        let signature = self.signer.sign(&data).await?;
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            data,
            signature,
            created_at: now_micros(),
        };

        Queries::insert_checkpoint(&mut *tx, &checkpoint).await?;
        let stamped =
            Queries::stamp_checkpoint_events(&mut *tx, chain_id, &checkpoint.id, first, last).await?;
        if stamped != expected_count {
            return Err(LedgerError::chain_integrity(
                first,
                format!(
                    "stamped {} of {} events; some were already sealed",
                    stamped, expected_count
                ),
            ));
        }
        tx.commit().await?;

        info!("Created {}", checkpoint.summary());

        if self.export_on_checkpoint && self.storage.is_some() {
            match self.export_checkpoint(checkpoint.data.checkpoint_number).await {
                Ok(object) => info!(
                    "Checkpoint {} exported to {}",
                    checkpoint.data.checkpoint_number, object.storage_key
                ),
                Err(e) => error!(
                    "Checkpoint {} committed but export failed: {}",
                    checkpoint.data.checkpoint_number, e
                ),
            }
        }

        Ok(checkpoint)
    }

    /// Re-verify the persisted chain between `start` and `end` (inclusive),
    /// anchored to the record before `start`. Nothing cached is trusted.
    pub async fn verify_chain(
        &self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<ChainVerification, LedgerError> {
        let chain_id = &self.config.chain_id;
        let pool = self.db.pool();

        let head = Queries::get_chain_head(pool, chain_id).await?;
        let start = start.unwrap_or(1).max(1);
        let end = match (&head, end) {
            (Some(head), Some(end)) => end.min(head.sequence_number),
            (Some(head), None) => head.sequence_number,
            (None, _) => 0,
        };

        let mut breaks = Vec::new();
        let mut checked: u64 = 0;
        if start <= end {
            let mut anchor = if start == 1 {
                Some(ChainHead::genesis())
            } else {
                Queries::get_event(pool, chain_id, start - 1)
                    .await?
                    .map(|e| e.head())
            };
            if anchor.is_none() {
                breaks.push(ChainBreak {
                    index: 0,
                    sequence_number: start - 1,
                    kind: BreakKind::SequenceGap,
                    message: format!("Predecessor record {} is missing", start - 1),
                });
            }

            let mut batch_start = start;
            while batch_start <= end {
                let batch_end = end.min(batch_start + VERIFY_BATCH_SIZE - 1);
                let records = Queries::get_events_range(pool, chain_id, batch_start, batch_end).await?;

                for mut brk in find_chain_breaks(&records, anchor.as_ref()) {
                    brk.index += checked as usize;
                    breaks.push(brk);
                }

                checked += records.len() as u64;
                if let Some(last) = records.last() {
                    anchor = Some(last.head());
                }
                batch_start = batch_end + 1;
            }
        }

        let first_break = breaks.first();
        let result = ChainVerification {
            is_valid: breaks.is_empty(),
            validated_count: first_break.map(|b| b.index as u64).unwrap_or(checked),
            invalid_at_sequence: first_break.map(|b| b.sequence_number),
            error: first_break.map(|b| b.message.clone()),
            breaks,
        };

        if result.is_valid {
            info!("Chain {} verified: {} records", chain_id, result.validated_count);
        } else {
            warn!(
                "Chain {} verification failed at sequence {:?} ({} break(s))",
                chain_id,
                result.invalid_at_sequence,
                result.breaks.len()
            );
        }
        Ok(result)
    }

    pub async fn get_stats(&self) -> Result<AuditStats, LedgerError> {
        let chain_id = &self.config.chain_id;
        let pool = self.db.pool();

        let totals = Queries::get_event_totals(pool, chain_id).await?;
        let total_checkpoints = Queries::count_checkpoints(pool, chain_id).await?;
        let latest = Queries::get_latest_checkpoint(pool, chain_id).await?;
        let head = Queries::get_chain_head(pool, chain_id)
            .await?
            .unwrap_or_else(ChainHead::genesis);

        let sealed_through = latest
            .as_ref()
            .map(|cp| cp.data.last_sequence_number)
            .unwrap_or(0);

        Ok(AuditStats {
            chain_id: chain_id.clone(),
            total_events: totals.count,
            total_checkpoints,
            first_event_at: totals.first_timestamp,
            last_event_at: totals.last_timestamp,
            last_checkpoint_number: latest.as_ref().map(|cp| cp.data.checkpoint_number),
            last_checkpoint_at: latest.as_ref().map(|cp| cp.created_at),
            pending_events: head.sequence_number.saturating_sub(sealed_through),
            head,
        })
    }

    pub async fn verify_checkpoint(
        &self,
        checkpoint_number: u64,
    ) -> Result<CheckpointVerification, LedgerError> {
        let chain_id = &self.config.chain_id;
        let checkpoint = Queries::get_checkpoint_by_number(self.db.pool(), chain_id, checkpoint_number)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Checkpoint {}", checkpoint_number)))?;

        let previous = if checkpoint_number > 1 {
            Queries::get_checkpoint_by_number(self.db.pool(), chain_id, checkpoint_number - 1).await?
        } else {
            None
        };
        self.check_checkpoint(&checkpoint, previous.as_ref()).await
    }

    /// Verify every checkpoint of the chain, collecting all results.
    pub async fn verify_all_checkpoints(&self) -> Result<Vec<CheckpointVerification>, LedgerError> {
        let checkpoints = Queries::list_checkpoints(self.db.pool(), &self.config.chain_id).await?;
        let mut results = Vec::with_capacity(checkpoints.len());
        let mut previous: Option<&Checkpoint> = None;

        for checkpoint in &checkpoints {
            results.push(self.check_checkpoint(checkpoint, previous).await?);
            previous = Some(checkpoint);
        }

        let failed = results.iter().filter(|r| !r.is_valid).count();
        if failed > 0 {
            warn!("{} of {} checkpoints failed verification", failed, results.len());
        } else {
            info!("All {} checkpoints verified", results.len());
        }
        Ok(results)
    }

    async fn check_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        previous: Option<&Checkpoint>,
    ) -> Result<CheckpointVerification, LedgerError> {
        let data = &checkpoint.data;
        let mut issues = Vec::new();

        if let Err(e) = data.validate_range() {
            issues.push(e.to_string());
        }

        let events = Queries::get_events_range(
            self.db.pool(),
            &data.chain_id,
            data.first_sequence_number,
            data.last_sequence_number,
        )
        .await?;

        let event_count_matches = events.len() as u64 == data.event_count;
        if !event_count_matches {
            issues.push(format!(
                "Checkpoint claims {} events, found {}",
                data.event_count,
                events.len()
            ));
        }

        for (index, event) in events.iter().enumerate() {
            if event.checkpoint_id.as_deref() != Some(checkpoint.id.as_str())
                || event.merkle_leaf_index != Some(index as u64)
            {
                issues.push(format!(
                    "Event {} is not stamped as leaf {} of this checkpoint",
                    event.sequence_number, index
                ));
            }
        }
        for brk in find_chain_breaks(&events, None) {
            issues.push(brk.message);
        }

        let leaves: Vec<String> = events.iter().map(|e| e.event_hash.clone()).collect();
        let root_matches = match MerkleTree::build(&leaves) {
            Ok(tree) => hashes_equal(&tree.root(), &data.merkle_root),
            Err(_) => false,
        };
        if !root_matches {
            issues.push(format!(
                "Merkle root {} cannot be reproduced from stored events",
                data.merkle_root
            ));
        }

        let linkage_valid = match previous {
            None => {
                data.checkpoint_number == 1
                    && data.first_sequence_number == 1
                    && data.previous_checkpoint_id.is_none()
                    && data.previous_merkle_root.is_none()
            }
            Some(prev) => {
                data.checkpoint_number == prev.data.checkpoint_number + 1
                    && data.first_sequence_number == prev.data.last_sequence_number + 1
                    && data.previous_checkpoint_id.as_deref() == Some(prev.id.as_str())
                    && data
                        .previous_merkle_root
                        .as_deref()
                        .map(|root| hashes_equal(root, &prev.data.merkle_root))
                        .unwrap_or(false)
            }
        };
        if !linkage_valid {
            issues.push(format!(
                "Checkpoint {} does not link to its predecessor",
                data.checkpoint_number
            ));
        }

        let signature = self
            .signer
            .verify_with_keyring(data, &checkpoint.signature)
            .await;
        match &signature {
            VerificationOutcome::Valid => {}
            VerificationOutcome::Invalid { reasons } => issues.extend(reasons.iter().cloned()),
            VerificationOutcome::Unverifiable { reason } => issues.push(reason.clone()),
        }

        Ok(CheckpointVerification {
            checkpoint_number: data.checkpoint_number,
            checkpoint_id: checkpoint.id.clone(),
            is_valid: issues.is_empty(),
            root_matches,
            event_count_matches,
            linkage_valid,
            signature,
            issues,
        })
    }

    /// Inclusion proof for a sealed event.
    pub async fn get_event_proof(&self, sequence_number: u64) -> Result<EventProof, LedgerError> {
        let chain_id = &self.config.chain_id;
        let pool = self.db.pool();

        let event = Queries::get_event(pool, chain_id, sequence_number)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Event {}", sequence_number)))?;
        let checkpoint_id = event.checkpoint_id.clone().ok_or_else(|| {
            LedgerError::NotFound(format!("Event {} is not sealed by a checkpoint yet", sequence_number))
        })?;
        let checkpoint = Queries::get_checkpoint_by_id(pool, &checkpoint_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Checkpoint {}", checkpoint_id)))?;
        if !checkpoint.data.covers(sequence_number) {
            return Err(LedgerError::chain_integrity(
                sequence_number,
                format!(
                    "Event {} is stamped with checkpoint {} covering {}..{}",
                    sequence_number,
                    checkpoint.data.checkpoint_number,
                    checkpoint.data.first_sequence_number,
                    checkpoint.data.last_sequence_number
                ),
            ));
        }

        let events = Queries::get_events_range(
            pool,
            chain_id,
            checkpoint.data.first_sequence_number,
            checkpoint.data.last_sequence_number,
        )
        .await?;
        let leaves: Vec<String> = events.iter().map(|e| e.event_hash.clone()).collect();
        let tree = MerkleTree::build(&leaves)?;

        let leaf_index = sequence_number - checkpoint.data.first_sequence_number;
        let proof = tree.generate_proof(leaf_index as usize)?;

        Ok(EventProof {
            event,
            checkpoint,
            proof,
        })
    }

    /// Check an event proof: event hash, leaf position, Merkle path and the
    /// checkpoint signature.
    pub async fn verify_event_proof(&self, event_proof: &EventProof) -> bool {
        let EventProof {
            event,
            checkpoint,
            proof,
        } = event_proof;

        if !event.verify_hash() || !hashes_equal(&proof.leaf_hash, &event.event_hash) {
            return false;
        }
        if !checkpoint.data.covers(event.sequence_number)
            || proof.leaf_index != event.sequence_number - checkpoint.data.first_sequence_number
        {
            return false;
        }
        if !verify_proof(proof, &checkpoint.data.merkle_root) {
            return false;
        }
        self.signer
            .verify_with_keyring(&checkpoint.data, &checkpoint.signature)
            .await
            .is_valid()
    }

    /// Assemble the self-contained export of one checkpoint.
    pub async fn build_checkpoint_bundle(
        &self,
        checkpoint_number: u64,
    ) -> Result<CheckpointBundle, LedgerError> {
        let pool = self.db.pool();
        let checkpoint =
            Queries::get_checkpoint_by_number(pool, &self.config.chain_id, checkpoint_number)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("Checkpoint {}", checkpoint_number)))?;

        let events = Queries::get_events_range(
            pool,
            &self.config.chain_id,
            checkpoint.data.first_sequence_number,
            checkpoint.data.last_sequence_number,
        )
        .await?;
        let leaves: Vec<String> = events.iter().map(|e| e.event_hash.clone()).collect();
        let tree = MerkleTree::build(&leaves)?;

        let key = self
            .signer
            .key_record(&checkpoint.signature.key_id)
            .await
            .ok_or_else(|| {
                LedgerError::Signing(format!(
                    "Unknown signing key {}",
                    checkpoint.signature.key_id
                ))
            })?;

        Ok(CheckpointBundle {
            checkpoint: checkpoint.data,
            signature: checkpoint.signature,
            public_key: key.public_key,
            events,
            merkle_proofs: tree.proofs()?,
            exported_at: now_micros(),
            export_version: EXPORT_VERSION.to_string(),
        })
    }

    /// Export a checkpoint to WORM storage. A checkpoint that already has a
    /// recorded export resolves to the stored object.
    pub async fn export_checkpoint(
        &self,
        checkpoint_number: u64,
    ) -> Result<StoredObject, LedgerError> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            LedgerError::Configuration("WORM storage is not configured".to_string())
        })?;
        let pool = self.db.pool();

        let checkpoint =
            Queries::get_checkpoint_by_number(pool, &self.config.chain_id, checkpoint_number)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("Checkpoint {}", checkpoint_number)))?;

        if let Some(export) = Queries::list_exports(pool, &checkpoint.id).await?.last() {
            match storage.head(&export.storage_key).await {
                Ok(object) => {
                    debug!(
                        "Checkpoint {} already exported to {}",
                        checkpoint_number, object.storage_key
                    );
                    return Ok(object);
                }
                Err(StorageError::NotFound(_)) => warn!(
                    "Recorded export {} of checkpoint {} is missing, exporting again",
                    export.storage_key, checkpoint_number
                ),
                Err(e) => return Err(e.into()),
            }
        }

        let bundle = self.build_checkpoint_bundle(checkpoint_number).await?;
        let object = storage.store_checkpoint(checkpoint_number, &bundle).await?;

        Queries::insert_export(
            pool,
            &CheckpointExport {
                checkpoint_id: checkpoint.id,
                storage_key: object.storage_key.clone(),
                version_id: object.version_id.clone(),
                content_hash: object.content_hash.clone(),
                retain_until: object.retain_until,
                exported_at: bundle.exported_at,
            },
        )
        .await?;

        Ok(object)
    }

    pub async fn list_exports(
        &self,
        checkpoint_number: u64,
    ) -> Result<Vec<CheckpointExport>, LedgerError> {
        let pool = self.db.pool();
        let checkpoint =
            Queries::get_checkpoint_by_number(pool, &self.config.chain_id, checkpoint_number)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("Checkpoint {}", checkpoint_number)))?;
        Queries::list_exports(pool, &checkpoint.id).await
    }

    /// Rotate the signing key and persist the rotation.
    pub async fn rotate_signing_key(&self) -> Result<String, LedgerError> {
        let state = self.state.lock().await;
        Self::ensure_ready(&state)?;

        let old_id = self.signer.active_key().await?.key_id;
        let new_id = self.signer.rotate_key().await?;

        let retired = self
            .signer
            .key_record(&old_id)
            .await
            .ok_or_else(|| LedgerError::Signing(format!("Key {} vanished", old_id)))?;
        let active = self
            .signer
            .key_record(&new_id)
            .await
            .ok_or_else(|| LedgerError::Signing(format!("Key {} vanished", new_id)))?;

        let mut tx = self.db.pool().begin().await?;
        Queries::retire_signing_key(&mut *tx, &retired).await?;
        Queries::insert_signing_key(&mut *tx, &active).await?;
        tx.commit().await?;

        info!("Signing key rotated: {} retired, {} active", old_id, new_id);
        Ok(new_id)
    }

    /// Reload the head from persistence and clear a halt.
    pub async fn resynchronize(&self) -> Result<ChainHead, LedgerError> {
        let mut state = self.state.lock().await;
        if state.phase == WriterPhase::Uninitialized {
            return Err(LedgerError::NotInitialized(
                "cannot resynchronize before initialize()".to_string(),
            ));
        }

        let head = Queries::get_chain_head(self.db.pool(), &self.config.chain_id)
            .await?
            .unwrap_or_else(ChainHead::genesis);
        if head != state.head {
            warn!(
                "Resynchronized chain {} from sequence {} to {}",
                self.config.chain_id, state.head.sequence_number, head.sequence_number
            );
        }
        state.head = head.clone();
        state.halted = None;
        Ok(head)
    }
}
