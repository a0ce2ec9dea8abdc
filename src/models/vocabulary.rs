//! The input unit: one Korean vocabulary term submitted as part of a batch.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PipelineError};

/// One vocabulary input. Immutable once enqueued.
///
/// Invariant: `(batch_id, position)` is unique within a batch; `position >= 1`;
/// `term` is non-empty after trimming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyItem {
    /// Monotonically assigned position, unique within the batch. Used for
    /// output ordering at the collector.
    pub position: u64,
    /// Opaque Korean text.
    pub term: String,
    /// Optional part-of-speech-like tag.
    #[serde(rename = "type", default)]
    pub type_hint: Option<String>,
    /// Batch this item belongs to.
    #[serde(default)]
    pub batch_id: String,
}

impl VocabularyItem {
    pub fn new(position: u64, term: impl Into<String>, type_hint: Option<String>) -> Self {
        Self {
            position,
            term: term.into(),
            type_hint,
            batch_id: String::new(),
        }
    }

    /// Validate the invariants documented on the type. Called once at
    /// enqueue time; tasks built from an already-validated item never
    /// re-check these.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.position == 0 {
            return Err(PipelineError::new(
                ErrorKind::SchemaValidation,
                "vocabulary item position must be >= 1",
            ));
        }
        if self.term.trim().is_empty() {
            return Err(PipelineError::new(
                ErrorKind::SchemaValidation,
                "vocabulary item term must be non-empty after trimming",
            ));
        }
        Ok(())
    }

    /// Normalized type hint used for fingerprinting: lowercase, trimmed,
    /// empty treated as absent.
    pub fn normalized_type(&self) -> String {
        self.type_hint
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_position() {
        let item = VocabularyItem::new(0, "안녕하세요", None);
        assert!(item.validate().is_err());
    }

    #[test]
    fn rejects_blank_term() {
        let item = VocabularyItem::new(1, "   ", None);
        assert!(item.validate().is_err());
    }

    #[test]
    fn normalizes_type_hint() {
        let item = VocabularyItem::new(1, "안녕하세요", Some("  Interjection ".to_string()));
        assert_eq!(item.normalized_type(), "interjection");

        let item = VocabularyItem::new(1, "안녕하세요", None);
        assert_eq!(item.normalized_type(), "");
    }
}
