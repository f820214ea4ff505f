//! Exact brute-force store kept in process memory.

use std::collections::HashSet;

use crate::error::StoreError;
use crate::record::{Modality, Record};
use crate::vector::dot;

use super::{DistanceMetric, Neighbor, VectorStore};

/// In-memory [`VectorStore`] with staged writes and cosine distance.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    rows: Vec<Record>,
    keys: HashSet<String>,
    staged: Vec<Record>,
    staged_keys: HashSet<String>,
}

impl MemoryVectorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed records in insertion order.
    pub fn records(&self) -> &[Record] {
        &self.rows
    }

    /// Whether uncommitted rows are staged.
    pub fn in_transaction(&self) -> bool {
        !self.staged.is_empty()
    }
}

impl VectorStore for MemoryVectorStore {
    fn insert_if_absent(&mut self, record: &Record) -> Result<bool, StoreError> {
        if self.keys.contains(&record.key) || self.staged_keys.contains(&record.key) {
            return Ok(false);
        }
        self.staged_keys.insert(record.key.clone());
        self.staged.push(record.clone());
        Ok(true)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.keys.extend(self.staged_keys.drain());
        self.rows.append(&mut self.staged);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.staged.clear();
        self.staged_keys.clear();
        Ok(())
    }

    fn nearest(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> Result<Vec<Neighbor>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(f64, &Record)> = self
            .rows
            .iter()
            .filter(|row| row.modality == modality)
            .map(|row| (1.0 - f64::from(dot(&row.vector, query)), row))
            .collect();
        // stable: equal distances keep insertion order
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(distance, row)| Neighbor {
                key: row.key.clone(),
                modality: row.modality,
                description: row.description.clone(),
                score: distance,
            })
            .collect())
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Cosine
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.rows.len())
    }
}
