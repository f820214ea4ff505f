#![warn(missing_docs)]
//! Core library for the medvault clinical evidence index: multi-modal
//! ingestion into one vector space and hybrid ranked retrieval over it.

pub mod brief;
pub mod config;
pub mod content_key;
pub mod embedder;
pub mod error;
pub mod fusion;
pub mod ingest;
pub mod record;
pub mod record_store;
pub mod search;
pub mod telemetry;
pub mod vector;
pub mod vector_store;

pub use brief::{BriefSynthesizer, ClinicalBrief};
pub use config::{EmbedderArgs, FusionWeights, StoreArgs, VaultArgs, VaultConfig};
pub use embedder::Embedder;
pub use error::{
    ConfigError, EncodingError, IngestError, MalformedInput, RecordStoreError, SearchError,
    StoreError,
};
pub use fusion::FusionEncoder;
pub use ingest::{IngestReport, Ingestor, RawRecord};
pub use record::{Modality, QueryResult, Record};
pub use record_store::{CommitTally, RecordStore, UpsertOutcome};
pub use search::{HybridQueryEngine, ModalityWarning, SearchOutcome};
pub use vector_store::{DistanceMetric, TableName, VectorStore};
