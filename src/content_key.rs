//! Content-addressed record keys.
//!
//! Keys are lowercase md5 hex digests, stable across runs and machines.

/// Hex digest of arbitrary bytes. Empty input hashes to the md5 of "".
pub fn hash_bytes(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}

/// Hex digest of a UTF-8 string.
pub fn hash_str(payload: &str) -> String {
    hash_bytes(payload.as_bytes())
}

/// Key for a text record: digest of `{subject_id}_{canonical description}`.
pub fn text_key(subject_id: &str, description: &str) -> String {
    let canonical = canonical_description(description);
    hash_str(&format!("{}_{}", subject_id.trim(), canonical))
}

/// Key for an image record: digest of the raw file bytes.
pub fn image_key(raw: &[u8]) -> String {
    hash_bytes(raw)
}

/// Trims and collapses internal whitespace runs to a single space.
pub fn canonical_description(description: &str) -> String {
    description.split_whitespace().collect::<Vec<_>>().join(" ")
}
