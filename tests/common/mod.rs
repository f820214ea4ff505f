#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashSet;

use medvault::error::StoreError;
use medvault::ingest::{ImageSource, ObservationRow, RawRecord};
use medvault::vector_store::memory::MemoryVectorStore;
use medvault::vector_store::{DistanceMetric, Neighbor, VectorStore};
use medvault::{Embedder, Modality, Record, VaultConfig};

pub const DIM: usize = 6;

const KEYWORDS: [&str; 4] = ["effusion", "glucose", "pneumonia", "body mass index"];
const OTHER_AXIS: usize = 4;
const IMAGE_AXIS: usize = 5;

/// One axis per clinical keyword; images share their own axis.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub text_calls: Cell<usize>,
}

impl Embedder for KeywordEmbedder {
    fn encode_text(&self, text: &str, _max_tokens: usize) -> anyhow::Result<Vec<f32>> {
        self.text_calls.set(self.text_calls.get() + 1);
        anyhow::ensure!(!text.contains("unembeddable"), "model rejected input");
        let lower = text.to_lowercase();
        let mut vector = vec![0.0; DIM];
        for (axis, keyword) in KEYWORDS.iter().enumerate() {
            if lower.contains(keyword) {
                vector[axis] = 1.0;
            }
        }
        if vector.iter().all(|v| *v == 0.0) {
            vector[OTHER_AXIS] = 1.0;
        }
        Ok(vector)
    }

    fn encode_image(&self, image: &[u8]) -> anyhow::Result<Vec<f32>> {
        anyhow::ensure!(!image.is_empty(), "empty image");
        let mut vector = vec![0.0; DIM];
        vector[IMAGE_AXIS] = 2.0;
        Ok(vector)
    }

    fn model_id(&self) -> &str {
        "keyword-test"
    }
}

/// Memory store with scripted failures. A failed insert or commit drops the
/// open transaction, like a Postgres session that lost its connection.
///
/// The first `healthy_commits` commits always succeed. A lost ack commits the
/// rows but still reports the connection as gone.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryVectorStore,
    pub healthy_commits: usize,
    pub failing_commits: usize,
    pub lost_acks: usize,
    pub failing_insert_calls: HashSet<usize>,
    pub failing_modalities: Vec<Modality>,
    pub insert_calls: usize,
    pub commit_calls: usize,
}

impl VectorStore for FlakyStore {
    fn insert_if_absent(&mut self, record: &Record) -> Result<bool, StoreError> {
        self.insert_calls += 1;
        if self.failing_insert_calls.contains(&self.insert_calls) {
            self.inner.rollback()?;
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.insert_if_absent(record)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.commit_calls += 1;
        if self.commit_calls <= self.healthy_commits {
            return self.inner.commit();
        }
        if self.lost_acks > 0 {
            self.lost_acks -= 1;
            self.inner.commit()?;
            return Err(StoreError::Unavailable("connection lost awaiting COMMIT ack".into()));
        }
        if self.failing_commits > 0 {
            self.failing_commits -= 1;
            self.inner.rollback()?;
            return Err(StoreError::Unavailable("server closed the connection".into()));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.rollback()
    }

    fn nearest(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> Result<Vec<Neighbor>, StoreError> {
        if self.failing_modalities.contains(&modality) {
            return Err(StoreError::Unavailable(format!("{modality} index offline")));
        }
        self.inner.nearest(query, modality, k)
    }

    fn metric(&self) -> DistanceMetric {
        self.inner.metric()
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.inner.len()
    }
}

pub fn config() -> VaultConfig {
    VaultConfig {
        embedding_dim: DIM,
        batch_commit_size: 10,
        commit_retries: 3,
        commit_backoff_ms: 0,
        ..VaultConfig::default()
    }
}

pub fn observation(patient: &str, description: &str, value: &str, units: &str) -> RawRecord {
    RawRecord::Observation(ObservationRow {
        patient: patient.into(),
        code: "2339-0".into(),
        description: description.into(),
        value: value.into(),
        units: units.into(),
        date: String::new(),
    })
}

pub fn glucose() -> RawRecord {
    observation("P1", "glucose", "180", "mg/dL")
}

pub fn xray(filename: &str, bytes: &[u8], labels: Option<&str>) -> RawRecord {
    RawRecord::Image(ImageSource {
        filename: filename.into(),
        bytes: bytes.to_vec(),
        finding_labels: labels.map(str::to_string),
    })
}

pub fn effusion_xray() -> RawRecord {
    xray("00000013_005.png", b"\x89PNG effusion", Some("Effusion"))
}
