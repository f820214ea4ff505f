//! Hybrid retrieval across modalities.
//!
//! The query is encoded once in the shared space and searched against every
//! configured modality. Per-modality lists are concatenated and ranked by
//! similarity; nothing is truncated globally, so callers see up to
//! `top_k_each` hits from each modality.

use serde::Serialize;
use tracing::{debug, warn};

use crate::embedder::Embedder;
use crate::error::{MalformedInput, RecordStoreError, SearchError};
use crate::fusion::encoder_failure;
use crate::record::{Modality, QueryResult};
use crate::record_store::RecordStore;
use crate::vector::checked_unit;
use crate::vector_store::VectorStore;

/// A modality whose lookup failed while others succeeded.
#[derive(Debug)]
pub struct ModalityWarning {
    /// Modality that was skipped.
    pub modality: Modality,
    /// Why it failed.
    pub error: RecordStoreError,
}

/// Ranked hits plus any modalities that were skipped.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    /// Hits ranked by similarity descending.
    pub results: Vec<QueryResult>,
    /// Modalities that failed and contributed no hits.
    pub warnings: Vec<ModalityWarning>,
}

impl SearchOutcome {
    /// Whether any modality was skipped.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Serializable view for the CLI and benchmark output.
    pub fn summary(&self) -> SearchSummary<'_> {
        SearchSummary {
            results: &self.results,
            warnings: self
                .warnings
                .iter()
                .map(|w| format!("{} search failed: {}", w.modality, w.error))
                .collect(),
        }
    }
}

/// JSON-friendly projection of a [`SearchOutcome`].
#[derive(Debug, Serialize)]
pub struct SearchSummary<'a> {
    /// Ranked hits.
    pub results: &'a [QueryResult],
    /// Human-readable warnings.
    pub warnings: Vec<String>,
}

/// Encodes queries and merges per-modality rankings.
pub struct HybridQueryEngine<'r, 's, E: Embedder + ?Sized, S: VectorStore + ?Sized> {
    embedder: &'r E,
    store: &'r RecordStore<'s, S>,
    modalities: Vec<Modality>,
    embedding_dim: usize,
    max_tokens: usize,
}

impl<'r, 's, E: Embedder + ?Sized, S: VectorStore + ?Sized> HybridQueryEngine<'r, 's, E, S> {
    /// Builds an engine over `store` searching `modalities` in order.
    pub fn new(
        embedder: &'r E,
        store: &'r RecordStore<'s, S>,
        modalities: Vec<Modality>,
        embedding_dim: usize,
        max_tokens: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            modalities,
            embedding_dim,
            max_tokens,
        }
    }

    /// Searches every modality for `query_text`, keeping up to `top_k_each`
    /// hits per modality.
    ///
    /// A failing modality becomes a [`ModalityWarning`]; the search only
    /// fails when the query cannot be encoded or every modality fails.
    pub fn search(&self, query_text: &str, top_k_each: usize) -> Result<SearchOutcome, SearchError> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(MalformedInput::new("query", "query text is empty").into());
        }

        let raw = self
            .embedder
            .encode_text(query_text, self.max_tokens)
            .map_err(|err| encoder_failure("query", err))?;
        let query = checked_unit(&raw, self.embedding_dim)?;

        let mut outcome = SearchOutcome::default();
        for &modality in &self.modalities {
            match self.store.top_k(&query, modality, top_k_each) {
                Ok(hits) => {
                    debug!(%modality, hits = hits.len(), "modality search finished");
                    outcome.results.extend(hits);
                }
                Err(error) => {
                    warn!(%modality, error = %error, "modality search failed; continuing");
                    outcome.warnings.push(ModalityWarning { modality, error });
                }
            }
        }

        if !self.modalities.is_empty() && outcome.warnings.len() == self.modalities.len() {
            let failures = outcome
                .warnings
                .into_iter()
                .map(|w| (w.modality, w.error))
                .collect();
            return Err(SearchError::AllModalitiesFailed(failures));
        }

        // stable: equal similarities keep modality order, then rank order
        outcome
            .results
            .sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::record::Record;
    use crate::vector_store::memory::MemoryVectorStore;
    use serde_json::Map;

    struct FixedEmbedder(Vec<f32>);

    impl Embedder for FixedEmbedder {
        fn encode_text(&self, text: &str, _max_tokens: usize) -> anyhow::Result<Vec<f32>> {
            anyhow::ensure!(text != "offline", "embedder offline");
            Ok(self.0.clone())
        }

        fn encode_image(&self, _image: &[u8]) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }

        fn model_id(&self) -> &str {
            "fixed"
        }
    }

    fn config() -> VaultConfig {
        VaultConfig {
            embedding_dim: 2,
            commit_backoff_ms: 0,
            ..VaultConfig::default()
        }
    }

    fn record(key: &str, modality: Modality, vector: Vec<f32>) -> Record {
        Record {
            key: key.into(),
            subject_id: "P1".into(),
            modality,
            description: key.into(),
            vector,
            metadata: Map::new(),
        }
    }

    fn seeded() -> MemoryVectorStore {
        let mut backend = MemoryVectorStore::new();
        {
            let mut store = RecordStore::new(&mut backend, &config());
            for row in [
                record("text-far", Modality::Text, vec![0.0, 1.0]),
                record("text-near", Modality::Text, vec![1.0, 0.2]),
                record("image-mid", Modality::Image, vec![1.0, 1.0]),
                record("image-tie", Modality::Image, vec![1.0, 0.2]),
            ] {
                store.upsert(row).unwrap();
            }
            store.finish().unwrap();
        }
        backend
    }

    #[test]
    fn merges_modalities_without_truncating() {
        let mut backend = seeded();
        let store = RecordStore::new(&mut backend, &config());
        let embedder = FixedEmbedder(vec![1.0, 0.0]);
        let engine = HybridQueryEngine::new(
            &embedder,
            &store,
            vec![Modality::Text, Modality::Image],
            2,
            256,
        );
        let outcome = engine.search("effusion", 2).unwrap();
        let keys: Vec<_> = outcome.results.iter().map(|r| r.description.as_str()).collect();
        // equal similarities keep text (configured first) ahead of image
        assert_eq!(keys, ["text-near", "image-tie", "image-mid", "text-far"]);
        assert!(outcome
            .results
            .windows(2)
            .all(|pair| pair[0].similarity >= pair[1].similarity));
        assert!(!outcome.is_degraded());
    }

    #[test]
    fn blank_query_is_rejected() {
        let mut backend = seeded();
        let store = RecordStore::new(&mut backend, &config());
        let embedder = FixedEmbedder(vec![1.0, 0.0]);
        let engine = HybridQueryEngine::new(&embedder, &store, vec![Modality::Text], 2, 256);
        assert!(matches!(engine.search("  ", 3), Err(SearchError::Malformed(_))));
    }

    #[test]
    fn query_encoding_failure_aborts() {
        let mut backend = seeded();
        let store = RecordStore::new(&mut backend, &config());
        let embedder = FixedEmbedder(vec![1.0, 0.0]);
        let engine = HybridQueryEngine::new(&embedder, &store, vec![Modality::Text], 2, 256);
        assert!(matches!(engine.search("offline", 3), Err(SearchError::Encoding(_))));
    }

    #[test]
    fn wrong_query_dimension_is_an_encoding_error() {
        let mut backend = seeded();
        let store = RecordStore::new(&mut backend, &config());
        let embedder = FixedEmbedder(vec![1.0, 0.0, 0.0]);
        let engine = HybridQueryEngine::new(&embedder, &store, vec![Modality::Text], 2, 256);
        assert!(matches!(
            engine.search("effusion", 3),
            Err(SearchError::Encoding(_))
        ));
    }
}
