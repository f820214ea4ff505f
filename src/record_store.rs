//! Idempotent, batch-committing record persistence over a [`VectorStore`].
//!
//! Rows are staged in an open transaction as they arrive and committed every
//! `batch_commit_size` upserts. Staged rows are also kept in memory so a
//! poisoned or failed transaction can be rolled back and replayed; only when
//! the retry budget runs out is the in-flight batch lost.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::error::{IngestError, MalformedInput, RecordStoreError, StoreError};
use crate::record::{Modality, QueryResult, Record};
use crate::vector::checked_unit;
use crate::vector_store::VectorStore;

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// A new row was staged.
    Inserted,
    /// A row with the same key already exists; nothing changed.
    SkippedDuplicate,
}

/// Committed write counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitTally {
    /// Rows durably inserted.
    pub inserted: usize,
    /// Upserts that hit an existing key, in committed batches.
    pub skipped: usize,
    /// Batches committed.
    pub batches: usize,
}

/// Scoped writer/reader over a borrowed store handle.
///
/// Dropping a `RecordStore` with an uncommitted batch rolls that batch back;
/// call [`RecordStore::finish`] to commit the tail.
pub struct RecordStore<'a, S: VectorStore + ?Sized> {
    store: &'a mut S,
    config: VaultConfig,
    batch_size: usize,
    staged: Vec<Record>,
    staged_skipped: usize,
    // rows of this batch found durable after a commit whose ack was lost
    staged_landed: usize,
    committed: CommitTally,
}

impl<'a, S: VectorStore + ?Sized> RecordStore<'a, S> {
    /// Wraps `store` using the dimension and batching options of `config`.
    pub fn new(store: &'a mut S, config: &VaultConfig) -> Self {
        Self {
            store,
            config: config.clone(),
            batch_size: config.batch_commit_size.max(1),
            staged: Vec::new(),
            staged_skipped: 0,
            staged_landed: 0,
            committed: CommitTally::default(),
        }
    }

    /// Counts for batches committed so far.
    pub fn committed(&self) -> CommitTally {
        self.committed
    }

    /// Upserts processed in the open batch.
    pub fn in_flight(&self) -> usize {
        self.staged.len() + self.staged_skipped + self.staged_landed
    }

    /// Borrowed backend.
    pub fn store(&self) -> &S {
        &*self.store
    }

    /// Validates, renormalizes and stages `record`.
    ///
    /// A key that already exists reports [`UpsertOutcome::SkippedDuplicate`]
    /// rather than an error. Per-record failures leave the batch intact;
    /// [`RecordStoreError::Fatal`] means the in-flight batch was lost.
    pub fn upsert(&mut self, mut record: Record) -> Result<UpsertOutcome, RecordStoreError> {
        validate_record(&record)?;
        record.vector = checked_unit(&record.vector, self.config.embedding_dim)?;

        let mut attempt = 0usize;
        let outcome = loop {
            match self.store.insert_if_absent(&record) {
                Ok(true) => break UpsertOutcome::Inserted,
                Ok(false) => break UpsertOutcome::SkippedDuplicate,
                Err(err) => {
                    // a failed statement poisons the transaction for every staged row
                    self.restage(false)?;
                    attempt += 1;
                    if err.is_retryable() && attempt <= self.config.commit_retries {
                        warn!(key = %record.key, attempt, error = %err, "insert failed, retrying");
                        thread::sleep(self.backoff(attempt));
                        continue;
                    }
                    return Err(RecordStoreError::Store(err));
                }
            }
        };

        match outcome {
            UpsertOutcome::Inserted => self.staged.push(record),
            UpsertOutcome::SkippedDuplicate => {
                debug!(key = %record.key, "duplicate key, skipping");
                self.staged_skipped += 1;
            }
        }
        if self.in_flight() >= self.batch_size {
            self.commit_batch()?;
        }
        Ok(outcome)
    }

    /// Commits the open batch, retrying transient failures.
    pub fn commit_batch(&mut self) -> Result<(), IngestError> {
        if self.in_flight() == 0 {
            return Ok(());
        }
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.store.commit() {
                Ok(()) => {
                    let inserted = self.staged.len() + self.staged_landed;
                    self.committed.inserted += inserted;
                    self.committed.skipped += self.staged_skipped;
                    self.committed.batches += 1;
                    info!(
                        batch = self.committed.batches,
                        inserted,
                        skipped = self.staged_skipped,
                        total_inserted = self.committed.inserted,
                        "committed batch"
                    );
                    self.staged.clear();
                    self.staged_skipped = 0;
                    self.staged_landed = 0;
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt <= self.config.commit_retries => {
                    warn!(attempt, error = %err, "batch commit failed, retrying");
                    thread::sleep(self.backoff(attempt));
                    self.restage(true)?;
                }
                Err(err) => return Err(self.lose_batch(attempt, err)),
            }
        }
    }

    /// Commits the tail batch and returns the final counts.
    pub fn finish(mut self) -> Result<CommitTally, IngestError> {
        self.commit_batch()?;
        Ok(self.committed)
    }

    /// Up to `k` records of `modality` most similar to `query`, ranked by
    /// cosine similarity descending with ties in insertion order.
    pub fn top_k(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> Result<Vec<QueryResult>, RecordStoreError> {
        let query = checked_unit(query, self.config.embedding_dim)?;
        let metric = self.store.metric();
        let mut results: Vec<QueryResult> = self
            .store
            .nearest(&query, modality, k)?
            .into_iter()
            .filter(|neighbor| neighbor.modality == modality)
            .map(|neighbor| QueryResult {
                modality: neighbor.modality,
                description: neighbor.description,
                similarity: metric.to_similarity(neighbor.score).clamp(-1.0, 1.0),
            })
            .collect();
        results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        results.truncate(k);
        Ok(results)
    }

    /// Rolls back and re-stages every row of the open batch in a fresh
    /// transaction.
    ///
    /// With `after_commit`, a row that is already present is taken to be
    /// this batch's own write from a commit that landed without its ack, and
    /// is counted as inserted. Otherwise another writer committed the key and
    /// the row counts as skipped.
    fn restage(&mut self, after_commit: bool) -> Result<(), IngestError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if let Err(err) = self.store.rollback() {
                debug!(error = %err, "rollback before restage failed");
            }
            let rows = std::mem::take(&mut self.staged);
            let mut kept = Vec::with_capacity(rows.len());
            let mut failure = None;
            for (idx, row) in rows.iter().enumerate() {
                match self.store.insert_if_absent(row) {
                    Ok(true) => kept.push(idx),
                    Ok(false) => {}
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = failure {
                self.staged = rows;
                if err.is_retryable() && attempt <= self.config.commit_retries {
                    warn!(attempt, error = %err, "restaging batch failed, retrying");
                    thread::sleep(self.backoff(attempt));
                    continue;
                }
                return Err(self.lose_batch(attempt, err));
            }
            let present = rows.len() - kept.len();
            if after_commit {
                self.staged_landed += present;
            } else {
                self.staged_skipped += present;
            }
            self.staged = rows
                .into_iter()
                .enumerate()
                .filter(|(idx, _)| kept.binary_search(idx).is_ok())
                .map(|(_, row)| row)
                .collect();
            debug!(rows = self.staged.len(), present, after_commit, "restaged batch");
            return Ok(());
        }
    }

    fn lose_batch(&mut self, attempts: usize, source: StoreError) -> IngestError {
        let lost = self.staged.len();
        if let Err(err) = self.store.rollback() {
            warn!(error = %err, "rollback of failed batch failed");
        }
        warn!(attempts, lost, error = %source, "batch rolled back");
        // rows that already landed stay durable
        self.committed.inserted += self.staged_landed;
        self.staged.clear();
        self.staged_skipped = 0;
        self.staged_landed = 0;
        IngestError::CommitFailed {
            attempts,
            lost,
            source,
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        self.config.commit_backoff(attempt)
    }
}

impl<S: VectorStore + ?Sized> Drop for RecordStore<'_, S> {
    fn drop(&mut self) {
        if self.in_flight() == 0 {
            return;
        }
        warn!(
            uncommitted = self.staged.len(),
            "record store released with an open batch; rolling back"
        );
        if let Err(err) = self.store.rollback() {
            warn!(error = %err, "rollback on release failed");
        }
    }
}

fn validate_record(record: &Record) -> Result<(), MalformedInput> {
    if record.key.trim().is_empty() {
        return Err(MalformedInput::new("record", "key is empty"));
    }
    if record.subject_id.trim().is_empty() {
        return Err(MalformedInput::new(
            "record",
            format!("record {} has no subject id", record.key),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::is_unit;
    use crate::vector_store::memory::MemoryVectorStore;
    use serde_json::Map;

    fn config(batch: usize) -> VaultConfig {
        VaultConfig {
            embedding_dim: 2,
            batch_commit_size: batch,
            commit_backoff_ms: 0,
            ..VaultConfig::default()
        }
    }

    fn record(key: &str, modality: Modality, vector: Vec<f32>) -> Record {
        Record {
            key: key.into(),
            subject_id: "P1".into(),
            modality,
            description: format!("desc {key}"),
            vector,
            metadata: Map::new(),
        }
    }

    #[test]
    fn second_upsert_of_same_key_is_skipped() {
        let mut backend = MemoryVectorStore::new();
        let mut store = RecordStore::new(&mut backend, &config(10));
        let row = record("k", Modality::Text, vec![3.0, 4.0]);
        assert_eq!(store.upsert(row.clone()).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(row).unwrap(), UpsertOutcome::SkippedDuplicate);
        let tally = store.finish().unwrap();
        assert_eq!((tally.inserted, tally.skipped), (1, 1));
        assert_eq!(backend.records().len(), 1);
    }

    #[test]
    fn vectors_are_renormalized_before_persistence() {
        let mut backend = MemoryVectorStore::new();
        let mut store = RecordStore::new(&mut backend, &config(10));
        store
            .upsert(record("k", Modality::Image, vec![3.0, 4.0]))
            .unwrap();
        store.finish().unwrap();
        assert!(is_unit(&backend.records()[0].vector));
    }

    #[test]
    fn commits_every_batch_size_upserts() {
        let mut backend = MemoryVectorStore::new();
        let mut store = RecordStore::new(&mut backend, &config(2));
        store.upsert(record("a", Modality::Text, vec![1.0, 0.0])).unwrap();
        assert_eq!(store.store().len().unwrap(), 0);
        store.upsert(record("b", Modality::Text, vec![0.0, 1.0])).unwrap();
        assert_eq!(store.store().len().unwrap(), 2);
        assert_eq!(store.committed().batches, 1);
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn drop_rolls_back_uncommitted_batch() {
        let mut backend = MemoryVectorStore::new();
        {
            let mut store = RecordStore::new(&mut backend, &config(10));
            store.upsert(record("a", Modality::Text, vec![1.0, 0.0])).unwrap();
        }
        assert!(backend.is_empty().unwrap());
        assert!(!backend.in_transaction());
    }

    #[test]
    fn rejects_wrong_dimension_and_blank_key() {
        let mut backend = MemoryVectorStore::new();
        let mut store = RecordStore::new(&mut backend, &config(10));
        assert!(matches!(
            store.upsert(record("a", Modality::Text, vec![1.0, 0.0, 0.0])),
            Err(RecordStoreError::Encoding(_))
        ));
        assert!(matches!(
            store.upsert(record(" ", Modality::Text, vec![1.0, 0.0])),
            Err(RecordStoreError::Malformed(_))
        ));
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn top_k_converts_distance_to_similarity() {
        let mut backend = MemoryVectorStore::new();
        let mut store = RecordStore::new(&mut backend, &config(10));
        store.upsert(record("a", Modality::Text, vec![1.0, 0.0])).unwrap();
        store.upsert(record("b", Modality::Text, vec![1.0, 1.0])).unwrap();
        store.upsert(record("c", Modality::Image, vec![1.0, 0.0])).unwrap();
        store.commit_batch().unwrap();

        let hits = store.top_k(&[2.0, 0.0], Modality::Text, 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].description, "desc a");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!((hits[1].similarity - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(hits.iter().all(|hit| hit.modality == Modality::Text));
    }
}
