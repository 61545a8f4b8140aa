use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::Type;

/// Lifecycle of a chunk relative to the approximate index.
///
/// `Pending` rows have a metadata record but no acknowledged index entry
/// yet. `Active` rows are fully indexed and searchable. `PendingRepair`
/// rows failed the second phase of an index write and are excluded from
/// search until the consistency validator re-adds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Active,
    PendingRepair,
}

impl std::fmt::Display for ChunkStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ChunkStatus::Pending => write!(f, "pending"),
            ChunkStatus::Active => write!(f, "active"),
            ChunkStatus::PendingRepair => write!(f, "pending_repair"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub internal_id: i64,
    pub document_id: String,
    pub chunk_offset: i64,
    pub content: String,
    pub token_count: i64,
    pub policy_type: Option<String>,
    pub embedding: Vec<u8>,
    pub dimension: i64,
    pub status: ChunkStatus,
    pub created_date: NaiveDateTime,
}

impl ChunkRecord {
    pub fn chunk_id(&self) -> String {
        format!("{}@{}", self.document_id, self.chunk_offset)
    }

    /// Decode the stored embedding back into a vector.
    pub fn vector(&self) -> Result<Vec<f32>> {
        decode_embedding(&self.embedding)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub document_id: String,
    pub chunk_offset: i64,
    pub content: String,
    pub token_count: i64,
    pub policy_type: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMeta {
    pub generation: i64,
    pub dimension: i64,
    pub rebuild_required: bool,
}

/// Embeddings are stored as little-endian f32 bytes so the metadata store
/// stays the source of truth for index rebuilds.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!(
            "corrupt embedding blob: {} bytes is not a multiple of 4",
            bytes.len()
        );
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
