//! Vector storage capability and its backends.
//!
//! The record store never assumes a distance convention: each backend reports
//! its [`DistanceMetric`] and scores are converted to cosine similarity in one
//! place, [`DistanceMetric::to_similarity`].

pub mod memory;
pub mod pg;
mod table;

pub use table::{quote_ident, TableName};

use crate::error::StoreError;
use crate::record::{Modality, Record};

/// Meaning of the score a backend returns for a neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// Cosine distance in `[0, 2]` (pgvector `<=>`); similarity = `1 - d`.
    Cosine,
    /// Negative inner product (pgvector `<#>`); similarity = `-d` for unit vectors.
    NegativeInnerProduct,
    /// Backend already returns cosine similarity.
    Similarity,
}

impl DistanceMetric {
    /// Converts a raw backend score into cosine similarity.
    pub fn to_similarity(self, score: f64) -> f32 {
        let similarity = match self {
            DistanceMetric::Cosine => 1.0 - score,
            DistanceMetric::NegativeInnerProduct => -score,
            DistanceMetric::Similarity => score,
        };
        similarity as f32
    }
}

/// Raw neighbour row returned by a backend, ordered best first.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Record key.
    pub key: String,
    /// Record modality.
    pub modality: Modality,
    /// Record description.
    pub description: String,
    /// Score in the backend's [`DistanceMetric`].
    pub score: f64,
}

/// Storage engine holding records and answering nearest-neighbour queries.
///
/// Writes are transactional: `insert_if_absent` stages a row inside the open
/// transaction, `commit` makes the staged rows durable and `rollback` drops
/// them. A transaction is opened lazily by the first insert.
pub trait VectorStore {
    /// Stages `record` unless its key already exists (committed or staged).
    /// Returns `true` when a row was staged.
    fn insert_if_absent(&mut self, record: &Record) -> Result<bool, StoreError>;

    /// Commits the open transaction. No-op when nothing is open.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Rolls back the open transaction. No-op when nothing is open.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Up to `k` committed records of `modality` nearest to `query`, best
    /// first, ties in insertion order.
    fn nearest(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> Result<Vec<Neighbor>, StoreError>;

    /// Convention of [`Neighbor::score`].
    fn metric(&self) -> DistanceMetric;

    /// Number of committed records.
    fn len(&self) -> Result<usize, StoreError>;

    /// Whether the store holds no committed records.
    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl<S: VectorStore + ?Sized> VectorStore for Box<S> {
    fn insert_if_absent(&mut self, record: &Record) -> Result<bool, StoreError> {
        (**self).insert_if_absent(record)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        (**self).rollback()
    }

    fn nearest(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> Result<Vec<Neighbor>, StoreError> {
        (**self).nearest(query, modality, k)
    }

    fn metric(&self) -> DistanceMetric {
        (**self).metric()
    }

    fn len(&self) -> Result<usize, StoreError> {
        (**self).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_conventions() {
        assert_eq!(DistanceMetric::Cosine.to_similarity(0.25), 0.75);
        assert_eq!(DistanceMetric::NegativeInnerProduct.to_similarity(-0.75), 0.75);
        assert_eq!(DistanceMetric::Similarity.to_similarity(0.75), 0.75);
    }
}
