//! Error taxonomy shared by ingestion and retrieval.

use thiserror::Error;

use crate::record::Modality;

/// Embedder failure or a vector that cannot be used as an embedding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The embedding capability itself failed.
    #[error("embedder failed to encode {input}: {reason}")]
    Embedder {
        /// Which input kind was being encoded (`text`, `image`, `query`).
        input: &'static str,
        /// Flattened error chain reported by the embedder.
        reason: String,
    },
    /// Vector length differs from the configured dimension.
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        /// Configured embedding dimension.
        expected: usize,
        /// Length of the returned vector.
        actual: usize,
    },
    /// Vector contains NaN or infinite components.
    #[error("embedding component {index} is not finite")]
    NonFinite {
        /// Index of the first offending component.
        index: usize,
    },
    /// Vector has zero length and cannot be normalized.
    #[error("embedding has zero norm")]
    ZeroNorm,
}

/// Source row is missing fields the pipeline needs.
#[derive(Debug, Error)]
#[error("malformed {source_kind} input: {reason}")]
pub struct MalformedInput {
    /// Kind of source row (`observation`, `image`, `query`).
    pub source_kind: &'static str,
    /// Human-readable description of what is missing.
    pub reason: String,
}

impl MalformedInput {
    /// Builds a new malformed-input error.
    pub fn new(source_kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            source_kind,
            reason: reason.into(),
        }
    }
}

/// Failures reported by a [`crate::vector_store::VectorStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient connectivity failure; callers may retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Non-transient backend failure (bad SQL, constraint other than the key, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Failures reported by [`crate::record_store::RecordStore`].
///
/// Everything except [`RecordStoreError::Fatal`] concerns a single record: the
/// record is skipped and the in-flight batch stays intact.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    /// Vector failed validation.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Record fields failed validation.
    #[error(transparent)]
    Malformed(#[from] MalformedInput),
    /// Backend rejected this record or this lookup.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The in-flight batch could not be committed or restored.
    #[error(transparent)]
    Fatal(#[from] IngestError),
}

/// Fatal ingestion failures. Per-record problems never surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A batch could not be committed (or re-staged) within the retry budget.
    #[error("batch commit failed after {attempts} attempt(s); {lost} uncommitted record(s) rolled back: {source}")]
    CommitFailed {
        /// Number of attempts made.
        attempts: usize,
        /// Records lost with the rolled back batch.
        lost: usize,
        /// Last backend error.
        #[source]
        source: StoreError,
    },
}

/// Failures that abort a whole hybrid search.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Query text was blank.
    #[error(transparent)]
    Malformed(#[from] MalformedInput),
    /// Query could not be encoded, so no modality can be searched.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Every configured modality failed.
    #[error("all {} modality queries failed", .0.len())]
    AllModalitiesFailed(Vec<(Modality, RecordStoreError)>),
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Embedding dimension is zero.
    #[error("embedding dimension must be positive")]
    ZeroDimension,
    /// No modalities configured.
    #[error("at least one modality must be configured")]
    NoModalities,
    /// Same modality listed twice.
    #[error("modality {0} listed more than once")]
    DuplicateModality(Modality),
    /// Fusion weights are negative, non-finite, sum above one or to zero.
    #[error("invalid fusion weights (image={image}, label={label}): {reason}")]
    FusionWeights {
        /// Image weight.
        image: f32,
        /// Label weight.
        label: f32,
        /// Which rule was violated.
        reason: &'static str,
    },
    /// Batch size of zero.
    #[error("batch commit size must be positive")]
    ZeroBatchSize,
    /// Top-k of zero.
    #[error("top_k_each must be positive")]
    ZeroTopK,
    /// Unknown modality name.
    #[error("unknown modality '{0}'; expected text or image")]
    UnknownModality(String),
}
