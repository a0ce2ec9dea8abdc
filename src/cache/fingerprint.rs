//! Deterministic content-addressed fingerprints for Stage 1 and Stage 2
//! cache entries.

use sha2::{Digest, Sha256};

const STAGE1_SCHEMA_VERSION: &str = "1";
const STAGE2_SCHEMA_VERSION: &str = "1";

/// Lowercase, trimmed form used by both the cache key and provider request.
/// `None` normalizes to the literal `"_"` sentinel so a missing type hint
/// does not collide with a hint that happens to be empty after trimming.
fn normalize_type(type_hint: Option<&str>) -> String {
    match type_hint.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_lowercase(),
        _ => "_".to_string(),
    }
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\x1f");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// `hash(term || normalized_type || stage1_schema_version)`.
pub fn stage1_fingerprint(term: &str, type_hint: Option<&str>) -> String {
    let normalized = normalize_type(type_hint);
    hash_parts(&[term.trim(), &normalized, STAGE1_SCHEMA_VERSION])
}

/// `hash(term || normalized_type || stage1_fingerprint || stage2_schema_version)`,
/// chaining Stage 2 to the exact Stage 1 artifact that produced it.
pub fn stage2_fingerprint(term: &str, type_hint: Option<&str>, stage1_fingerprint: &str) -> String {
    let normalized = normalize_type(type_hint);
    hash_parts(&[
        term.trim(),
        &normalized,
        stage1_fingerprint,
        STAGE2_SCHEMA_VERSION,
    ])
}
