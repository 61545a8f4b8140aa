#[cfg(test)]
mod tests;

pub mod consistency;

use std::sync::Arc;

use tracing::{debug, info};

use crate::Result;
use crate::chunking::{Chunk, chunk_document};
use crate::config::ChunkingConfig;
use crate::inference::InferenceClient;
use crate::store::VectorStoreCoordinator;
use crate::store::metadata::models::NewChunk;

pub use consistency::{ConsistencyReport, ConsistencyValidator, RepairReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_total: usize,
    pub chunks_indexed: usize,
    pub chunks_skipped: usize,
}

/// Ingestion pipeline: chunk a document, embed the chunks through the
/// cached batch endpoint, and hand them to the coordinator for the
/// two-phase index write.
pub struct Ingestor {
    coordinator: Arc<VectorStoreCoordinator>,
    client: InferenceClient,
    chunking: ChunkingConfig,
}

impl Ingestor {
    pub fn new(
        coordinator: Arc<VectorStoreCoordinator>,
        client: InferenceClient,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            coordinator,
            client,
            chunking,
        }
    }

    pub async fn ingest(
        &self,
        document_id: &str,
        text: &str,
        policy_type: Option<&str>,
    ) -> Result<IngestReport> {
        let chunks = chunk_document(document_id, text, &self.chunking)?;
        if chunks.is_empty() {
            debug!("document '{}' produced no chunks", document_id);
            return Ok(IngestReport {
                document_id: document_id.to_string(),
                chunks_total: 0,
                chunks_indexed: 0,
                chunks_skipped: 0,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let client = self.client.clone();
        let embeddings = tokio::task::spawn_blocking(move || client.embed_batch(&texts))
            .await
            .map_err(|e| crate::EngineError::Other(e.into()))??;

        let payload: Vec<(NewChunk, Vec<f32>)> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                (
                    new_chunk(chunk, policy_type, &embedding),
                    embedding,
                )
            })
            .collect();

        let receipt = self.coordinator.index(document_id, payload).await?;

        info!(
            "ingested document '{}': {} chunks ({} indexed, {} already present)",
            document_id,
            chunks.len(),
            receipt.chunks_indexed,
            receipt.chunks_skipped
        );

        Ok(IngestReport {
            document_id: document_id.to_string(),
            chunks_total: chunks.len(),
            chunks_indexed: receipt.chunks_indexed,
            chunks_skipped: receipt.chunks_skipped,
        })
    }
}

fn new_chunk(chunk: &Chunk, policy_type: Option<&str>, embedding: &[f32]) -> NewChunk {
    NewChunk {
        document_id: chunk.document_id.clone(),
        chunk_offset: chunk.offset as i64,
        content: chunk.content.clone(),
        token_count: chunk.token_count as i64,
        policy_type: policy_type.map(str::to_string),
        embedding: embedding.to_vec(),
    }
}
