use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::PriorId;

/// A citation record retrieved during the experience phase, scored by
/// cosine similarity against the submitted prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prior {
    pub id: PriorId,
    pub content: String,
    #[serde(default)]
    pub source_message: String,
    #[serde(default)]
    pub source_thread: String,
    /// Similarity score in `[0, 1]`.
    pub similarity: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Prior {
    /// Display ordering: similarity descending, ties broken by recency.
    pub fn display_cmp(&self, other: &Prior) -> std::cmp::Ordering {
        other
            .similarity
            .partial_cmp(&self.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}
