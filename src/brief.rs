//! Presentation of ranked hits as a short clinical brief.

use std::fmt::Write as _;

use crate::record::{Modality, QueryResult};

/// Renders ranked results for a human reader. Must not reorder or drop hits.
pub trait BriefSynthesizer {
    /// Formats `results` (already ranked) for `query`.
    fn render(&self, query: &str, results: &[QueryResult]) -> String;
}

/// Lab and imaging summary in the style of a draft radiology note.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClinicalBrief;

impl BriefSynthesizer for ClinicalBrief {
    fn render(&self, query: &str, results: &[QueryResult]) -> String {
        let labs: Vec<&str> = by_modality(results, Modality::Text).collect();
        let images = by_modality(results, Modality::Image).count();

        let mut out = String::new();
        let _ = writeln!(out, "DRAFT CLINICAL BRIEF FOR: {query}");
        let _ = writeln!(out, "{}", "-".repeat(60));
        match labs.first() {
            Some(first) => {
                let _ = writeln!(
                    out,
                    "LABORATORY SUMMARY: Found {} relevant lab observation(s), including {first}.",
                    labs.len()
                );
            }
            None => {
                let _ = writeln!(out, "LABORATORY SUMMARY: No relevant lab observations found.");
            }
        }
        if images == 0 {
            let _ = writeln!(out, "IMAGING SUMMARY: No images matched {query}.");
        } else {
            let _ = writeln!(
                out,
                "IMAGING SUMMARY: Identified {images} image(s) consistent with {query}."
            );
        }
        out
    }
}

fn by_modality(results: &[QueryResult], modality: Modality) -> impl Iterator<Item = &str> {
    results
        .iter()
        .filter(move |hit| hit.modality == modality)
        .map(|hit| hit.description.as_str())
}
