use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::models::{ChunkRecord, ChunkStatus, IndexMeta, NewChunk, encode_embedding};

const CHUNK_COLUMNS: &str = "internal_id, document_id, chunk_offset, content, token_count, \
                             policy_type, embedding, dimension, status, created_date";

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChunkRecord> {
    let status_str: String = row.get("status");
    let status = match status_str.as_str() {
        "pending" => ChunkStatus::Pending,
        "active" => ChunkStatus::Active,
        "pending_repair" => ChunkStatus::PendingRepair,
        _ => return Err(anyhow::anyhow!("Invalid chunk status: {}", status_str)),
    };

    Ok(ChunkRecord {
        internal_id: row.get("internal_id"),
        document_id: row.get("document_id"),
        chunk_offset: row.get("chunk_offset"),
        content: row.get("content"),
        token_count: row.get("token_count"),
        policy_type: row.get("policy_type"),
        embedding: row.get("embedding"),
        dimension: row.get("dimension"),
        status,
        created_date: row.get("created_date"),
    })
}

pub struct DocumentQueries;

impl DocumentQueries {
    #[inline]
    pub async fn upsert(pool: &SqlitePool, document_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO documents (id, created_date) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(document_id)
            .bind(Utc::now())
            .execute(pool)
            .await
            .context("Failed to upsert document")?;
        Ok(())
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM documents")
            .fetch_one(pool)
            .await
            .context("Failed to count documents")?;
        Ok(row.get("count"))
    }
}

pub struct ChunkQueries;

impl ChunkQueries {
    /// Insert a chunk in `pending` status. Re-submitting the same
    /// `(document_id, chunk_offset)` returns the existing row untouched.
    #[inline]
    pub async fn create(pool: &SqlitePool, new_chunk: NewChunk) -> Result<(ChunkRecord, bool)> {
        if let Some(existing) =
            Self::get_by_identity(pool, &new_chunk.document_id, new_chunk.chunk_offset).await?
        {
            debug!(
                "chunk {}@{} already stored, skipping insert",
                new_chunk.document_id, new_chunk.chunk_offset
            );
            return Ok((existing, false));
        }

        let dimension = new_chunk.embedding.len() as i64;
        let embedding = encode_embedding(&new_chunk.embedding);

        let id = sqlx::query(
            r#"
            INSERT INTO chunks (document_id, chunk_offset, content, token_count,
                                policy_type, embedding, dimension, status, created_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT (document_id, chunk_offset) DO NOTHING
            "#,
        )
        .bind(&new_chunk.document_id)
        .bind(new_chunk.chunk_offset)
        .bind(&new_chunk.content)
        .bind(new_chunk.token_count)
        .bind(&new_chunk.policy_type)
        .bind(&embedding)
        .bind(dimension)
        .bind(Utc::now())
        .execute(pool)
        .await
        .context("Failed to insert chunk")?
        .last_insert_rowid();

        let record = Self::get_by_internal_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve inserted chunk"))?;
        Ok((record, true))
    }

    #[inline]
    pub async fn get_by_internal_id(pool: &SqlitePool, id: i64) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE internal_id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get chunk by internal id")?;

        row.as_ref().map(chunk_from_row).transpose()
    }

    #[inline]
    pub async fn get_by_identity(
        pool: &SqlitePool,
        document_id: &str,
        chunk_offset: i64,
    ) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ? AND chunk_offset = ?"
        ))
        .bind(document_id)
        .bind(chunk_offset)
        .fetch_optional(pool)
        .await
        .context("Failed to get chunk by identity")?;

        row.as_ref().map(chunk_from_row).transpose()
    }

    #[inline]
    pub async fn get_by_internal_ids(
        pool: &SqlitePool,
        ids: &[i64],
    ) -> Result<Vec<ChunkRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE internal_id IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query
            .fetch_all(pool)
            .await
            .context("Failed to get chunks by internal ids")?;

        rows.iter().map(chunk_from_row).collect()
    }

    #[inline]
    pub async fn set_status(pool: &SqlitePool, id: i64, status: ChunkStatus) -> Result<()> {
        sqlx::query("UPDATE chunks SET status = ? WHERE internal_id = ?")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to update chunk status")?;
        Ok(())
    }

    #[inline]
    pub async fn list_by_status(
        pool: &SqlitePool,
        status: ChunkStatus,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE status = ? ORDER BY internal_id"
        ))
        .bind(status)
        .fetch_all(pool)
        .await
        .context("Failed to list chunks by status")?;

        rows.iter().map(chunk_from_row).collect()
    }

    #[inline]
    pub async fn count_by_status(pool: &SqlitePool, status: ChunkStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM chunks WHERE status = ?")
            .bind(status)
            .fetch_one(pool)
            .await
            .context("Failed to count chunks by status")?;
        Ok(row.get("count"))
    }

    #[inline]
    pub async fn active_internal_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT internal_id FROM chunks WHERE status = 'active' ORDER BY internal_id")
            .fetch_all(pool)
            .await
            .context("Failed to list active chunk ids")?;
        Ok(rows.iter().map(|row| row.get("internal_id")).collect())
    }
}

pub struct IndexMetaQueries;

impl IndexMetaQueries {
    /// Create the singleton metadata row if it does not exist yet.
    #[inline]
    pub async fn ensure(pool: &SqlitePool, dimension: i64) -> Result<IndexMeta> {
        sqlx::query(
            "INSERT INTO index_meta (id, generation, dimension, rebuild_required) \
             VALUES (1, 0, ?, 0) ON CONFLICT(id) DO NOTHING",
        )
        .bind(dimension)
        .execute(pool)
        .await
        .context("Failed to initialize index metadata")?;

        Self::get(pool).await
    }

    #[inline]
    pub async fn get(pool: &SqlitePool) -> Result<IndexMeta> {
        let row = sqlx::query(
            "SELECT generation, dimension, rebuild_required FROM index_meta WHERE id = 1",
        )
        .fetch_one(pool)
        .await
        .context("Failed to read index metadata")?;

        let rebuild: i64 = row.get("rebuild_required");
        Ok(IndexMeta {
            generation: row.get("generation"),
            dimension: row.get("dimension"),
            rebuild_required: rebuild != 0,
        })
    }

    #[inline]
    pub async fn bump_generation(pool: &SqlitePool) -> Result<i64> {
        sqlx::query("UPDATE index_meta SET generation = generation + 1 WHERE id = 1")
            .execute(pool)
            .await
            .context("Failed to bump index generation")?;
        Ok(Self::get(pool).await?.generation)
    }

    #[inline]
    pub async fn set_rebuild_required(pool: &SqlitePool, required: bool) -> Result<()> {
        sqlx::query("UPDATE index_meta SET rebuild_required = ? WHERE id = 1")
            .bind(required as i64)
            .execute(pool)
            .await
            .context("Failed to update rebuild flag")?;
        Ok(())
    }

    #[inline]
    pub async fn set_dimension(pool: &SqlitePool, dimension: i64) -> Result<()> {
        sqlx::query("UPDATE index_meta SET dimension = ? WHERE id = 1")
            .bind(dimension)
            .execute(pool)
            .await
            .context("Failed to update index dimension")?;
        Ok(())
    }
}
