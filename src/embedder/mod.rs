//! Embedding capability consumed by ingestion and search.

pub mod http;

use anyhow::Result;

/// Maps text or images into the shared D-dimensional vector space.
///
/// Implementations may or may not normalize; callers always renormalize.
pub trait Embedder {
    /// Encodes text, truncating inputs longer than `max_tokens`.
    fn encode_text(&self, text: &str, max_tokens: usize) -> Result<Vec<f32>>;

    /// Encodes raw image file bytes (PNG/JPEG).
    fn encode_image(&self, image: &[u8]) -> Result<Vec<f32>>;

    /// Model identifier recorded in record metadata.
    fn model_id(&self) -> &str;
}

impl<E: Embedder + ?Sized> Embedder for &E {
    fn encode_text(&self, text: &str, max_tokens: usize) -> Result<Vec<f32>> {
        (**self).encode_text(text, max_tokens)
    }

    fn encode_image(&self, image: &[u8]) -> Result<Vec<f32>> {
        (**self).encode_image(image)
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// Keeps at most `max_tokens` whitespace-delimited tokens of `text`.
///
/// Word count underestimates subword tokens, so servers should still apply
/// their own truncation; this only bounds request size.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    if max_tokens == 0 {
        return "";
    }
    let mut seen = 0usize;
    let mut in_token = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_token = false;
            continue;
        }
        if !in_token {
            if seen == max_tokens {
                return text[..idx].trim_end();
            }
            seen += 1;
            in_token = true;
        }
    }
    text
}
