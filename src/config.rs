//! Vault configuration shared by ingestion and query binaries.

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::embedder::http::HttpEmbedder;
use crate::error::ConfigError;
use crate::record::Modality;
use crate::vector_store::pg::PgVectorStore;
use crate::vector_store::TableName;

/// Weights applied when fusing an image embedding with its label embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    /// Weight of the visual embedding.
    pub image: f32,
    /// Weight of the finding-label embedding.
    pub label: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            image: 0.7,
            label: 0.3,
        }
    }
}

impl FusionWeights {
    /// Non-negative, finite, sum in `(0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let err = |reason| ConfigError::FusionWeights {
            image: self.image,
            label: self.label,
            reason,
        };
        if !self.image.is_finite() || !self.label.is_finite() {
            return Err(err("weights must be finite"));
        }
        if self.image < 0.0 || self.label < 0.0 {
            return Err(err("weights must be non-negative"));
        }
        let sum = self.image + self.label;
        if sum > 1.0 + f32::EPSILON {
            return Err(err("weights must sum to at most 1"));
        }
        if sum == 0.0 {
            return Err(err("at least one weight must be positive"));
        }
        Ok(())
    }
}

/// Recognized vault options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Embedding dimension D, identical across modalities.
    pub embedding_dim: usize,
    /// Modalities searched by the hybrid engine, in query order.
    pub modalities: Vec<Modality>,
    /// Image/label fusion weights.
    pub fusion_weights: FusionWeights,
    /// Records per committed batch.
    pub batch_commit_size: usize,
    /// Default per-modality result count.
    pub top_k_each: usize,
    /// Text truncation budget handed to the embedder.
    pub max_tokens: usize,
    /// Extra commit attempts after a transient failure.
    pub commit_retries: usize,
    /// Base delay between commit attempts, in milliseconds.
    pub commit_backoff_ms: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 512,
            modalities: vec![Modality::Text, Modality::Image],
            fusion_weights: FusionWeights::default(),
            batch_commit_size: 100,
            top_k_each: 3,
            max_tokens: 256,
            commit_retries: 3,
            commit_backoff_ms: 250,
        }
    }
}

impl VaultConfig {
    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::ZeroDimension);
        }
        if self.modalities.is_empty() {
            return Err(ConfigError::NoModalities);
        }
        for (idx, modality) in self.modalities.iter().enumerate() {
            if self.modalities[..idx].contains(modality) {
                return Err(ConfigError::DuplicateModality(*modality));
            }
        }
        self.fusion_weights.validate()?;
        if self.batch_commit_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.top_k_each == 0 {
            return Err(ConfigError::ZeroTopK);
        }
        Ok(())
    }

    /// Delay before commit attempt `attempt` (1-based), capped at 2^5 steps.
    pub fn commit_backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        Duration::from_millis(self.commit_backoff_ms.saturating_mul(1 << capped))
    }
}

/// Command-line flags shared by binaries that build a [`VaultConfig`].
#[derive(Args, Debug, Clone)]
pub struct VaultArgs {
    /// Embedding dimension produced by the model
    #[arg(long, env = "MEDVAULT_EMBEDDING_DIM", default_value_t = 512)]
    pub embedding_dim: usize,

    /// Modalities to search, comma separated
    #[arg(long, env = "MEDVAULT_MODALITIES", default_value = "text,image")]
    pub modalities: String,

    /// Weight of the image embedding when fusing
    #[arg(long, env = "MEDVAULT_FUSION_IMAGE", default_value_t = 0.7)]
    pub fusion_image_weight: f32,

    /// Weight of the finding-label embedding when fusing
    #[arg(long, env = "MEDVAULT_FUSION_LABEL", default_value_t = 0.3)]
    pub fusion_label_weight: f32,

    /// Records per committed batch
    #[arg(long, env = "MEDVAULT_BATCH_COMMIT", default_value_t = 100)]
    pub batch_commit_size: usize,

    /// Results fetched per modality
    #[arg(long, env = "MEDVAULT_TOP_K_EACH", default_value_t = 3)]
    pub top_k_each: usize,

    /// Token budget for text inputs; longer inputs are truncated
    #[arg(long, env = "MEDVAULT_MAX_TOKENS", default_value_t = 256)]
    pub max_tokens: usize,

    /// Retries for a failed batch commit
    #[arg(long, env = "MEDVAULT_COMMIT_RETRIES", default_value_t = 3)]
    pub commit_retries: usize,

    /// Base backoff between commit retries in milliseconds
    #[arg(long, env = "MEDVAULT_COMMIT_BACKOFF_MS", default_value_t = 250)]
    pub commit_backoff_ms: u64,
}

impl VaultArgs {
    /// Converts parsed flags into a validated [`VaultConfig`].
    pub fn build_config(&self) -> Result<VaultConfig, ConfigError> {
        let config = VaultConfig {
            embedding_dim: self.embedding_dim,
            modalities: self.modalities_vec()?,
            fusion_weights: FusionWeights {
                image: self.fusion_image_weight,
                label: self.fusion_label_weight,
            },
            batch_commit_size: self.batch_commit_size,
            top_k_each: self.top_k_each,
            max_tokens: self.max_tokens,
            commit_retries: self.commit_retries,
            commit_backoff_ms: self.commit_backoff_ms,
        };
        config.validate()?;
        Ok(config)
    }

    fn modalities_vec(&self) -> Result<Vec<Modality>, ConfigError> {
        self.modalities
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

/// Connection flags for the pgvector backend.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding the records table
    #[arg(long, env = "MEDVAULT_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Records table name
    #[arg(long, env = "MEDVAULT_TABLE", default_value = "patient_records")]
    pub table: String,
}

impl StoreArgs {
    /// Validated table name.
    pub fn table_name(&self) -> anyhow::Result<TableName> {
        TableName::new(self.schema.clone(), self.table.clone())
    }

    /// Opens a session against the configured table.
    pub fn connect(&self) -> anyhow::Result<PgVectorStore> {
        PgVectorStore::connect(&self.database_url, self.table_name()?)
    }
}

/// Flags for the embedding server.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// Base URL of the OpenAI-compatible embeddings API
    #[arg(
        long,
        env = "MEDVAULT_EMBED_BASE",
        default_value = "http://localhost:7997"
    )]
    pub embed_base_url: String,

    /// Joint text/image embedding model
    #[arg(
        long,
        env = "MEDVAULT_EMBED_MODEL",
        default_value = "microsoft/BiomedCLIP-PubMedBERT_256-vit_base_patch16_224"
    )]
    pub embed_model: String,

    /// Bearer token, if the server requires one
    #[arg(long, env = "MEDVAULT_EMBED_API_KEY")]
    pub embed_api_key: Option<String>,

    /// Max seconds to wait for one embedding request
    #[arg(long, env = "MEDVAULT_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    pub embed_timeout_secs: u64,

    /// Retries for transient embedding errors
    #[arg(long, env = "MEDVAULT_EMBED_MAX_RETRIES", default_value_t = 5)]
    pub embed_max_retries: usize,
}

impl EmbedderArgs {
    /// Builds the HTTP embedder.
    pub fn build(&self) -> anyhow::Result<HttpEmbedder> {
        HttpEmbedder::new(
            self.embed_api_key.clone(),
            self.embed_base_url.clone(),
            self.embed_model.clone(),
            Duration::from_secs(self.embed_timeout_secs.max(1)),
            self.embed_max_retries,
        )
    }
}
