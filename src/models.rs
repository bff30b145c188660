//! Core data models.
//!
//! These types represent the areas, documents, chunks, chats, and messages
//! that flow through the ingestion and answer pipelines. All timestamps are
//! Unix seconds (UTC).

use serde::{Deserialize, Serialize};

/// Processing lifecycle of an uploaded document.
///
/// Transitions are driven solely by the ingestion pipeline:
/// `Uploaded -> Processing -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Uploaded => "Uploaded",
            ProcessingStatus::Processing => "Processing",
            ProcessingStatus::Completed => "Completed",
            ProcessingStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Uploaded" => Some(ProcessingStatus::Uploaded),
            "Processing" => Some(ProcessingStatus::Processing),
            "Completed" => Some(ProcessingStatus::Completed),
            "Failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// A named collection scoping documents and chats.
///
/// `document_count` and `chat_count` are cached counters, recomputed by
/// re-counting inside the same transaction as any mutation of the child set.
#[derive(Debug, Clone, Serialize)]
pub struct Area {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub document_count: i64,
    pub chat_count: i64,
}

/// One uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub area_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub uploaded_at: i64,
    pub processing_status: ProcessingStatus,
    pub chunk_count: i64,
    pub error_message: Option<String>,
}

/// A contiguous slice of a document's text plus its embedding vector.
///
/// The embedding is stored as raw little-endian f32 bytes, 4 bytes per
/// component, no header. Chunks are written once per document in a single
/// batch and never individually mutated.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: i64,
    pub embedding: Vec<u8>,
    pub metadata: Option<String>,
}

/// A conversation scoped to one area.
#[derive(Debug, Clone, Serialize)]
pub struct Chat {
    pub id: String,
    pub area_id: String,
    pub name: String,
    pub created_at: i64,
    pub last_message_at: Option<i64>,
    pub message_count: i64,
}

/// One turn in a chat. `content_html` and `sources` are set for assistant
/// messages only.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub content_html: Option<String>,
    pub sources: Option<String>,
    pub created_at: i64,
}

/// A scored chunk returned by the vector retriever.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub content: String,
    pub document_name: String,
    pub chunk_index: i64,
    pub similarity: f32,
}

/// A citation persisted alongside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_name: String,
    pub chunk_index: i64,
    pub similarity: f32,
}

impl From<&ChunkMatch> for SourceRef {
    fn from(m: &ChunkMatch) -> Self {
        SourceRef {
            document_name: m.document_name.clone(),
            chunk_index: m.chunk_index,
            similarity: m.similarity,
        }
    }
}
