//! Record and result types owned by the embedding store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Display;

use crate::eid::{OwnerId, RecordId};

/// Intended use of an embedding. Passed to the provider as a task hint;
/// never affects distance computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    RetrievalQuery,
    RetrievalDocument,
    SemanticSimilarity,
    Classification,
    Clustering,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::RetrievalQuery,
        TaskType::RetrievalDocument,
        TaskType::SemanticSimilarity,
        TaskType::Classification,
        TaskType::Clustering,
    ];

    /// Wire name, also used as the provider task hint.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::RetrievalQuery => "RETRIEVAL_QUERY",
            TaskType::RetrievalDocument => "RETRIEVAL_DOCUMENT",
            TaskType::SemanticSimilarity => "SEMANTIC_SIMILARITY",
            TaskType::Classification => "CLASSIFICATION",
            TaskType::Clustering => "CLUSTERING",
        }
    }

    pub fn from_code(code: u8) -> Option<TaskType> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(&self) -> u8 {
        match self {
            TaskType::RetrievalQuery => 0,
            TaskType::RetrievalDocument => 1,
            TaskType::SemanticSimilarity => 2,
            TaskType::Classification => 3,
            TaskType::Clustering => 4,
        }
    }
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::RetrievalDocument
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hex-encoded SHA-256 digest of the exact source text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        ContentHash(format!("{digest:x}"))
    }

    /// Wraps an already computed digest, e.g. one read back from disk.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        ContentHash(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub source_ref_id: String,
    pub task_type: TaskType,
    pub vector: Vec<f32>,
    pub content_hash: ContentHash,
    pub source_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Insertion sequence inside the owner partition, the last ordering tie-break.
    #[serde(skip)]
    pub(crate) seq: u64,
}

/// Unique key of a record inside one owner partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub source_ref_id: String,
    pub task_type: TaskType,
}

impl EmbeddingRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            source_ref_id: self.source_ref_id.clone(),
            task_type: self.task_type,
        }
    }
}

/// Input of [`crate::store::EmbeddingStore::put`].
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub source_ref_id: String,
    pub task_type: TaskType,
    pub vector: Vec<f32>,
    pub content_hash: ContentHash,
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarMatch {
    pub record_id: RecordId,
    pub source_ref_id: String,
    pub score: f32,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCandidate {
    pub record_id: RecordId,
    pub source_ref_id: String,
    pub similarity: f32,
    pub is_exact_duplicate: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStats {
    pub count: usize,
    pub distinct_task_types: usize,
    pub avg_text_length: f64,
    pub oldest_created_at: Option<DateTime<Utc>>,
    pub newest_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAssignment {
    pub record_id: RecordId,
    pub source_ref_id: String,
    pub cluster_id: usize,
    pub distance: f32,
}
