//! Core data models shared across the pipeline and the chat memory.
//!
//! These types are storage-agnostic: SQLite, in-memory, and any future
//! backend all read and write the same structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Lifecycle of one document generation.
///
/// ```text
/// pending ──▶ processing ──┬──▶ completed
///                          └──▶ failed
/// ```
///
/// Terminal states are only left by starting a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(RagError::validation(format!(
                "unknown document status '{other}'"
            ))),
        }
    }
}

/// Where a document's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Text,
    Pdf,
    Url,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Text => "text",
            SourceType::Pdf => "pdf",
            SourceType::Url => "url",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(SourceType::Text),
            "pdf" => Ok(SourceType::Pdf),
            "url" => Ok(SourceType::Url),
            other => Err(RagError::validation(format!("unknown source type '{other}'"))),
        }
    }
}

/// A document record as tracked by the ingestion pipeline.
///
/// `status` is the single source of truth for pipeline progress. The
/// transition methods below refuse anything the state machine forbids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: Option<String>,
    pub title: String,
    pub source_type: SourceType,
    pub status: DocumentStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only when `status == Failed`.
    pub error: Option<String>,
    pub chunk_count: usize,
    /// Incremented by every new ingestion request for the same id.
    pub generation: u32,
    pub deleted: bool,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>, source_type: SourceType) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: None,
            title: title.into(),
            source_type,
            status: DocumentStatus::Pending,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            error: None,
            chunk_count: 0,
            generation: 1,
            deleted: false,
        }
    }

    /// Reset a terminal document into a fresh `pending` generation.
    pub fn begin_generation(&mut self) -> Result<u32> {
        if !self.status.is_terminal() {
            return Err(RagError::Conflict(format!(
                "document {} is still {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.generation += 1;
        self.status = DocumentStatus::Pending;
        self.error = None;
        self.chunk_count = 0;
        self.deleted = false;
        self.updated_at = Utc::now();
        Ok(self.generation)
    }

    pub fn start_processing(&mut self) -> Result<()> {
        self.transition(DocumentStatus::Processing)
    }

    /// Mark completed. A run that produced no chunks cannot complete.
    pub fn complete(&mut self, chunk_count: usize) -> Result<()> {
        if chunk_count == 0 {
            return Err(RagError::processing("document produced no chunks"));
        }
        self.transition(DocumentStatus::Completed)?;
        self.chunk_count = chunk_count;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(DocumentStatus::Failed)?;
        self.chunk_count = 0;
        self.error = Some(error.into());
        Ok(())
    }

    fn transition(&mut self, next: DocumentStatus) -> Result<()> {
        use DocumentStatus::*;
        let allowed = matches!(
            (self.status, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        );
        if !allowed {
            return Err(RagError::Conflict(format!(
                "document {}: illegal transition {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A chunk of a document's text, produced by [`crate::chunk`].
///
/// `start..end` is the byte span of `text` inside the source document, so
/// chunk spans can be checked for coverage against the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub start: usize,
    pub end: usize,
    /// The chunk is a single indivisible unit longer than the size limit.
    pub oversized: bool,
}

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub score: f32,
}

/// Chat roles understood by completion models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Normalise role labels written by other tools (`human`, `ai`, ...).
    pub fn normalize(label: &str) -> Result<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" | "human" => Ok(Role::User),
            "assistant" | "ai" | "bot" => Ok(Role::Assistant),
            other => Err(RagError::validation(format!("unknown role '{other}'"))),
        }
    }
}

/// One entry of a conversation's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A role-tagged message handed to a completion model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ChatMessage> for LlmMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

/// Status of a background ingestion task. Mirrors [`DocumentStatus`] plus
/// a distinct cancelled terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Pipeline progress counter. Only ever moves forward within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Queued = 0,
    Loaded = 1,
    Chunked = 2,
    Embedded = 3,
    Stored = 4,
}

impl IngestStage {
    pub fn counter(self) -> u8 {
        self as u8
    }
}
