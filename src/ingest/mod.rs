//! Ingestion pipeline: source rows to keyed, embedded, persisted records.
//!
//! Per-row problems (bad source line, missing fields, embedder failure,
//! rejected insert) are logged with the row index and counted in
//! [`IngestReport::failed`]; ingestion continues. Only a batch that cannot be
//! committed aborts the run.

pub mod sources;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::VaultConfig;
use crate::content_key::{image_key, text_key};
use crate::embedder::Embedder;
use crate::error::{ConfigError, IngestError, MalformedInput, RecordStoreError};
use crate::fusion::{encoder_failure, FusionEncoder};
use crate::record::{Modality, Record};
use crate::record_store::{RecordStore, UpsertOutcome};
use crate::vector_store::VectorStore;

pub use sources::{ImageLabelRow, ImageSource, LabelIndex, ObservationRow, RawRecord};

/// Provenance tag stored with every image record.
pub const IMAGE_SOURCE_TAG: &str = "NIH_Dataset_Medical_CLIP";

/// Counts for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Rows durably inserted.
    pub inserted: usize,
    /// Rows whose key already existed.
    pub skipped: usize,
    /// Rows dropped because of a per-row error.
    pub failed: usize,
}

/// Turns raw rows into records and persists them.
pub struct Ingestor<'e, E: Embedder + ?Sized> {
    embedder: &'e E,
    fusion: FusionEncoder,
    config: VaultConfig,
}

impl<'e, E: Embedder + ?Sized> Ingestor<'e, E> {
    /// Builds an ingestor, rejecting a `config` that fails validation.
    pub fn new(embedder: &'e E, config: VaultConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let fusion = FusionEncoder::new(
            config.fusion_weights,
            config.embedding_dim,
            config.max_tokens,
        )?;
        Ok(Self {
            embedder,
            fusion,
            config,
        })
    }

    /// Ingests `rows` into `store`, committing every `batch_commit_size`
    /// upserts and once more at the end.
    ///
    /// Re-running over the same rows inserts nothing.
    pub fn ingest<S, I>(&self, store: &mut S, rows: I) -> Result<IngestReport, IngestError>
    where
        S: VectorStore + ?Sized,
        I: IntoIterator<Item = Result<RawRecord, MalformedInput>>,
    {
        let mut records = RecordStore::new(store, &self.config);
        let mut failed = 0usize;

        for (index, row) in rows.into_iter().enumerate() {
            let record = match row.map_err(RecordStoreError::from).and_then(|raw| self.prepare(&raw)) {
                Ok(record) => record,
                Err(err) => {
                    warn!(index, error = %err, "skipping source row");
                    failed += 1;
                    continue;
                }
            };
            let key = record.key.clone();
            match records.upsert(record) {
                Ok(UpsertOutcome::Inserted) | Ok(UpsertOutcome::SkippedDuplicate) => {}
                Err(RecordStoreError::Fatal(err)) => {
                    let committed = records.committed();
                    warn!(
                        index,
                        key = %key,
                        committed = committed.inserted,
                        "ingestion aborted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(index, key = %key, error = %err, "failed to store record");
                    failed += 1;
                }
            }
        }

        let tally = records.finish()?;
        let report = IngestReport {
            inserted: tally.inserted,
            skipped: tally.skipped,
            failed,
        };
        info!(
            inserted = report.inserted,
            skipped = report.skipped,
            failed = report.failed,
            batches = tally.batches,
            "ingestion finished"
        );
        Ok(report)
    }

    /// Builds the keyed, embedded record for one source row.
    pub fn prepare(&self, raw: &RawRecord) -> Result<Record, RecordStoreError> {
        match raw {
            RawRecord::Observation(row) => self.prepare_observation(row),
            RawRecord::Image(image) => self.prepare_image(image),
        }
    }

    fn prepare_observation(&self, row: &ObservationRow) -> Result<Record, RecordStoreError> {
        let description = row.render()?;
        let vector = self
            .embedder
            .encode_text(&description, self.config.max_tokens)
            .map_err(|err| encoder_failure("text", err))?;
        let mut metadata = Map::new();
        metadata.insert("code".into(), Value::String(row.code.clone()));
        metadata.insert("date".into(), Value::String(row.date.clone()));
        metadata.insert("original_id".into(), Value::String(row.patient.clone()));
        metadata.insert("model".into(), json!(self.embedder.model_id()));
        Ok(Record {
            key: text_key(&row.patient, &description),
            subject_id: row.patient.trim().to_string(),
            modality: Modality::Text,
            description,
            vector,
            metadata,
        })
    }

    fn prepare_image(&self, image: &ImageSource) -> Result<Record, RecordStoreError> {
        if image.filename.trim().is_empty() {
            return Err(MalformedInput::new("image", "file name is empty").into());
        }
        if image.bytes.is_empty() {
            return Err(
                MalformedInput::new("image", format!("{} has no content", image.filename)).into(),
            );
        }
        let label = image.label_prompt();
        if label.is_none() {
            warn!(file = %image.filename, "no finding labels; embedding image only");
        }
        let vector = self
            .fusion
            .encode(self.embedder, &image.bytes, label.as_deref())?;
        let mut metadata = Map::new();
        metadata.insert("source".into(), json!(IMAGE_SOURCE_TAG));
        metadata.insert("filename".into(), json!(image.filename));
        metadata.insert("model".into(), json!(self.embedder.model_id()));
        Ok(Record {
            key: image_key(&image.bytes),
            subject_id: image.filename.clone(),
            modality: Modality::Image,
            description: image.render(),
            vector,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::memory::MemoryVectorStore;
    use pretty_assertions::assert_eq;

    struct TinyEmbedder;

    impl Embedder for TinyEmbedder {
        fn encode_text(&self, text: &str, _max_tokens: usize) -> anyhow::Result<Vec<f32>> {
            anyhow::ensure!(!text.contains("poison"), "refused");
            Ok(vec![0.0, 1.0])
        }

        fn encode_image(&self, _image: &[u8]) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        fn model_id(&self) -> &str {
            "tiny"
        }
    }

    fn config() -> VaultConfig {
        VaultConfig {
            embedding_dim: 2,
            batch_commit_size: 2,
            commit_backoff_ms: 0,
            ..VaultConfig::default()
        }
    }

    fn observation(patient: &str, description: &str) -> RawRecord {
        RawRecord::Observation(ObservationRow {
            patient: patient.into(),
            code: "2339-0".into(),
            description: description.into(),
            value: "180".into(),
            units: "mg/dL".into(),
            date: String::new(),
        })
    }

    #[test]
    fn text_record_carries_key_and_metadata() {
        let ingestor = Ingestor::new(&TinyEmbedder, config()).unwrap();
        let record = ingestor.prepare(&observation("P1", "glucose")).unwrap();
        assert_eq!(record.modality, Modality::Text);
        assert_eq!(record.description, "Observation: glucose value: 180 mg/dL");
        assert_eq!(
            record.key,
            text_key("P1", "Observation: glucose value: 180 mg/dL")
        );
        assert_eq!(record.metadata["code"], json!("2339-0"));
        assert_eq!(record.metadata["original_id"], json!("P1"));
        assert_eq!(record.metadata["model"], json!("tiny"));
    }

    #[test]
    fn image_record_is_keyed_by_content() {
        let ingestor = Ingestor::new(&TinyEmbedder, config()).unwrap();
        let image = ImageSource {
            filename: "00000013_005.png".into(),
            bytes: b"fake png".to_vec(),
            finding_labels: Some("Effusion".into()),
        };
        let record = ingestor.prepare(&RawRecord::Image(image)).unwrap();
        assert_eq!(record.key, image_key(b"fake png"));
        assert_eq!(record.subject_id, "00000013_005.png");
        assert_eq!(record.metadata["source"], json!("NIH_Dataset_Medical_CLIP"));
        assert_eq!(record.metadata["filename"], json!("00000013_005.png"));
        assert!(record.description.starts_with("Chest X-ray findings: Effusion."));
    }

    #[test]
    fn per_row_failures_are_counted_not_fatal() {
        let ingestor = Ingestor::new(&TinyEmbedder, config()).unwrap();
        let mut backend = MemoryVectorStore::new();
        let rows = vec![
            Ok(observation("P1", "glucose")),
            Err(MalformedInput::new("observation", "line 2: bad json")),
            Ok(observation("P1", "poison")),
            Ok(observation("", "glucose")),
            Ok(observation("P1", "glucose")),
        ];
        let report = ingestor.ingest(&mut backend, rows).unwrap();
        assert_eq!(
            report,
            IngestReport {
                inserted: 1,
                skipped: 1,
                failed: 3,
            }
        );
        assert_eq!(backend.records().len(), 1);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut zero_weights = config();
        zero_weights.fusion_weights = crate::config::FusionWeights {
            image: 0.0,
            label: 0.0,
        };
        assert!(matches!(
            Ingestor::new(&TinyEmbedder, zero_weights),
            Err(ConfigError::FusionWeights { .. })
        ));

        let mut zero_batch = config();
        zero_batch.batch_commit_size = 0;
        assert!(matches!(
            Ingestor::new(&TinyEmbedder, zero_batch),
            Err(ConfigError::ZeroBatchSize)
        ));
    }
}
