//! Core data models used throughout Research Forge.
//!
//! These types represent the chunks, tasks, and research documents that flow
//! through the retrieval and generation pipeline.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Smallest indexed unit of source text with an embedding vector.
///
/// The id is the hex SHA-256 of the chunk text, so indexing identical text
/// twice is a no-op.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub platform: Option<String>,
    pub techniques: Vec<String>,
}

impl Chunk {
    pub fn new(
        document_id: &str,
        text: &str,
        embedding: Vec<f32>,
        platform: Option<String>,
        techniques: Vec<String>,
    ) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self {
            id: format!("{:x}", hasher.finalize()),
            document_id: document_id.to_string(),
            text: text.to_string(),
            embedding,
            platform,
            techniques,
        }
    }
}

/// A chunk returned from similarity search, with its cosine score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f64,
}

/// A source file ingested into the vector index.
#[derive(Debug, Clone)]
pub struct ReferenceDocument {
    pub id: String,
    pub title: String,
    pub path: String,
    pub platform: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Task lifecycle states. Claims transition only through the queue API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "claimed" => Some(TaskStatus::Claimed),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Active tasks block duplicate enqueues for the same key.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Claimed | TaskStatus::InProgress
        )
    }
}

/// A queued unit of research work for one (technique, platform) pair.
#[derive(Debug, Clone)]
pub struct ResearchTask {
    pub id: String,
    pub technique_id: String,
    pub technique_name: String,
    pub platform: String,
    pub status: TaskStatus,
    pub owner: Option<String>,
    pub claim_expires_at: Option<i64>,
    pub attempt_count: i64,
    pub not_before: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The unit of record: one structured research document per
/// (technique_id, platform) key.
///
/// Sections may be empty; consumers must not assume any is populated.
/// `quality_score` and `completeness_score` are derived and recomputed on
/// every write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchOutput {
    pub technique_id: String,
    pub platform: String,
    pub technique_name: String,

    pub description: String,
    pub detection: String,
    pub mitigation: String,
    pub playbook: String,
    pub references: String,
    pub notes: String,

    /// Research confidence on a 0–10 scale, supplied by the caller.
    pub confidence_score: f64,
    /// Derived, 0–1. See [`crate::scoring`].
    pub quality_score: f64,
    /// Derived, 0–1. See [`crate::scoring`].
    pub completeness_score: f64,

    pub sources: Vec<String>,
    pub tags: Vec<String>,
    pub related_techniques: Vec<String>,

    pub research_context: Option<String>,
    pub custom_fields: Option<serde_json::Map<String, serde_json::Value>>,

    pub created_at: i64,
    pub last_updated: i64,
}

impl ResearchOutput {
    /// The six required sections, in canonical order.
    pub fn sections(&self) -> [(&'static str, &str); 6] {
        [
            ("description", self.description.as_str()),
            ("detection", self.detection.as_str()),
            ("mitigation", self.mitigation.as_str()),
            ("playbook", self.playbook.as_str()),
            ("references", self.references.as_str()),
            ("notes", self.notes.as_str()),
        ]
    }

    pub fn section(&self, name: &str) -> Option<&str> {
        self.sections()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, text)| text)
    }
}

/// Partial update applied to a research document via
/// [`crate::store::OutputStore::upsert`].
///
/// `None` fields leave the existing document untouched; `Some` fields
/// overwrite. Only the natural key is mandatory.
#[derive(Debug, Clone, Default)]
pub struct OutputPatch {
    pub technique_id: String,
    pub platform: String,
    pub technique_name: Option<String>,

    pub description: Option<String>,
    pub detection: Option<String>,
    pub mitigation: Option<String>,
    pub playbook: Option<String>,
    pub references: Option<String>,
    pub notes: Option<String>,

    pub confidence_score: Option<f64>,
    pub sources: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub related_techniques: Option<Vec<String>>,
    pub research_context: Option<String>,
    pub custom_fields: Option<serde_json::Map<String, serde_json::Value>>,
}

impl OutputPatch {
    pub fn new(technique_id: &str, platform: &str) -> Self {
        Self {
            technique_id: technique_id.to_string(),
            platform: platform.to_string(),
            ..Default::default()
        }
    }
}

/// Assembled grounding context returned by the retrieval engine.
///
/// `text` is empty when no relevant chunks exist or the index is down;
/// callers treat that as a valid, lower-confidence path.
#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    pub text: String,
    pub sources: Vec<String>,
    pub chunks_used: usize,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Ranked summary returned by output search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub technique_id: String,
    pub platform: String,
    pub technique_name: String,
    pub quality_score: f64,
    pub completeness_score: f64,
    pub last_updated: i64,
}

/// Extract MITRE ATT&CK technique ids (`T1055`, `T1003.001`) from text,
/// deduplicated in first-seen order.
pub fn extract_technique_ids(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"T\d{4}(?:\.\d{3})?").unwrap());

    let mut seen = Vec::new();
    for m in re.find_iter(text) {
        let id = m.as_str().to_string();
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_content_hash() {
        let a = Chunk::new("doc1", "same text", vec![], None, vec![]);
        let b = Chunk::new("doc2", "same text", vec![], None, vec![]);
        assert_eq!(a.id, b.id);

        let c = Chunk::new("doc1", "other text", vec![], None, vec![]);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Claimed,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_active_states() {
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Claimed.is_active());
        assert!(TaskStatus::InProgress.is_active());
        assert!(!TaskStatus::Completed.is_active());
        assert!(!TaskStatus::Failed.is_active());
    }

    #[test]
    fn test_extract_technique_ids() {
        let text = "See T1055 and T1003.001; T1055 appears twice, T999 is not valid.";
        assert_eq!(
            extract_technique_ids(text),
            vec!["T1055".to_string(), "T1003.001".to_string()]
        );
    }

    #[test]
    fn test_sections_order() {
        let output = ResearchOutput {
            description: "d".into(),
            ..Default::default()
        };
        let names: Vec<&str> = output.sections().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "description",
                "detection",
                "mitigation",
                "playbook",
                "references",
                "notes"
            ]
        );
        assert_eq!(output.section("description"), Some("d"));
        assert_eq!(output.section("nope"), None);
    }
}
