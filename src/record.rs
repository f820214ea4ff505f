//! Stored record and query result shapes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Kind of evidence a record was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Structured lab observation rendered as text.
    Text,
    /// Chest X-ray image (fused with its finding label).
    Image,
}

impl Modality {
    /// Storage label used in the `content_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Modality::Text),
            "image" => Ok(Modality::Image),
            other => Err(ConfigError::UnknownModality(other.to_string())),
        }
    }
}

/// Unit of storage: one embedded piece of clinical evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Content-addressed identifier (md5 hex).
    pub key: String,
    /// Owning entity, e.g. patient id or image file name.
    pub subject_id: String,
    /// Modality fixed at creation.
    pub modality: Modality,
    /// Human-readable rendering of the source content.
    pub description: String,
    /// Unit-normalized embedding.
    pub vector: Vec<f32>,
    /// Free-form provenance (source code, date, filename, model id).
    pub metadata: Map<String, Value>,
}

/// One ranked hit returned by a search. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Modality of the matched record.
    pub modality: Modality,
    /// Description of the matched record.
    pub description: String,
    /// Cosine similarity against the query vector.
    pub similarity: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modality_parses_case_insensitively() {
        assert_eq!(" Image ".parse::<Modality>().unwrap(), Modality::Image);
        assert_eq!("TEXT".parse::<Modality>().unwrap(), Modality::Text);
        assert_eq!(
            "audio".parse::<Modality>().unwrap_err(),
            ConfigError::UnknownModality("audio".into())
        );
    }

    #[test]
    fn modality_serializes_as_storage_label() {
        let json = serde_json::to_string(&Modality::Image).unwrap();
        assert_eq!(json, "\"image\"");
        assert_eq!(Modality::Text.to_string(), "text");
    }
}
