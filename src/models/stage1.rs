//! Stage 1 artifact: structured semantic analysis of a term ("nuance creator").

use serde::{Deserialize, Serialize};

/// Structured semantic analysis produced by the Stage 1 LLM call. Written
/// only by the orchestrator after a successful LLM call (or restored
/// verbatim from the cache); immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Artifact {
    pub term: String,
    /// Stamped by the orchestrator from the originating task's batch
    /// position the first time this artifact is computed (never trusted
    /// from the LLM response). Carried forward into every `Stage2Row` built
    /// from this artifact so exporters can group cards by term without
    /// re-joining on the term string.
    #[serde(default)]
    pub term_number: u32,
    /// IPA-like pronunciation guide.
    pub pronunciation: String,
    pub part_of_speech: String,
    pub primary_meaning: String,
    #[serde(default)]
    pub secondary_meanings: Vec<String>,
    /// Metaphor used downstream by Stage 2 to build a memorable primer.
    pub metaphor: String,
    /// Anchor phrase/image used downstream by Stage 2.
    pub anchor: String,
    #[serde(default)]
    pub comparison: Option<RelatedTermComparison>,
    #[serde(default)]
    pub homonyms: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedTermComparison {
    pub related_term: String,
    pub distinction: String,
}

impl Stage1Artifact {
    /// A Stage 1 artifact must carry enough content for Stage 2 to produce
    /// cards from it; an LLM response missing required fields is a schema
    /// validation failure, not a usable (if sparse) artifact.
    pub fn validate(&self) -> Result<(), String> {
        if self.term.trim().is_empty() {
            return Err("stage1 artifact missing term".to_string());
        }
        if self.primary_meaning.trim().is_empty() {
            return Err("stage1 artifact missing primary_meaning".to_string());
        }
        if self.part_of_speech.trim().is_empty() {
            return Err("stage1 artifact missing part_of_speech".to_string());
        }
        Ok(())
    }
}
