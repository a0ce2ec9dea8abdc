//! Stage 2 artifact: the ordered list of flashcard rows for one term.

use serde::{Deserialize, Serialize};

/// One flashcard row within a Stage 2 artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Row {
    /// Position of this row within the term's card set (not the batch position).
    pub row_position: u32,
    pub term: String,
    /// Carried forward from Stage 1 so downstream exporters can group cards
    /// belonging to the same term without re-joining on the term string.
    pub term_number: u32,
    pub tab_name: String,
    pub primer: String,
    pub front: String,
    pub back: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub honorific_level: HonorificLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HonorificLevel {
    Formal,
    Polite,
    Casual,
    Intimate,
    Neutral,
}

/// An ordered list of flashcard rows for one term, produced after Stage 1
/// is available. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Artifact {
    pub term: String,
    pub rows: Vec<Stage2Row>,
}

impl Stage2Artifact {
    pub fn validate(&self) -> Result<(), String> {
        if self.rows.is_empty() {
            return Err("stage2 artifact produced zero rows".to_string());
        }
        for row in &self.rows {
            if row.front.trim().is_empty() || row.back.trim().is_empty() {
                return Err(format!(
                    "stage2 row {} for term {:?} missing front/back text",
                    row.row_position, row.term
                ));
            }
        }
        Ok(())
    }
}
