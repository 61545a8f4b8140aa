use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use crate::store::metadata::models::{ChunkRecord, ChunkStatus, IndexMeta, NewChunk};
use crate::store::metadata::queries::{ChunkQueries, DocumentQueries, IndexMetaQueries};


pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

/// SQLite-backed metadata store. Owns chunk text, embedding blobs and the
/// per-chunk index lifecycle; the approximate index holds nothing but
/// `(internal_id, vector)` pairs and can always be rebuilt from here.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/store/metadata/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    pub async fn initialize_from_base_dir(base_dir: &Path) -> Result<Self> {
        let db_path = base_dir.join("metadata.db");

        std::fs::create_dir_all(base_dir).with_context(|| {
            format!("Failed to create data directory: {}", base_dir.display())
        })?;

        Self::new(db_path).await
    }

    // Document operations
    pub async fn upsert_document(&self, document_id: &str) -> Result<()> {
        DocumentQueries::upsert(&self.pool, document_id).await
    }

    pub async fn count_documents(&self) -> Result<i64> {
        DocumentQueries::count(&self.pool).await
    }

    // Chunk operations
    pub async fn insert_chunk(&self, chunk: NewChunk) -> Result<(ChunkRecord, bool)> {
        ChunkQueries::create(&self.pool, chunk).await
    }

    pub async fn get_chunk(&self, internal_id: i64) -> Result<Option<ChunkRecord>> {
        ChunkQueries::get_by_internal_id(&self.pool, internal_id).await
    }

    pub async fn get_chunks_by_internal_ids(&self, ids: &[i64]) -> Result<Vec<ChunkRecord>> {
        ChunkQueries::get_by_internal_ids(&self.pool, ids).await
    }

    pub async fn set_chunk_status(&self, internal_id: i64, status: ChunkStatus) -> Result<()> {
        ChunkQueries::set_status(&self.pool, internal_id, status).await
    }

    pub async fn chunks_by_status(&self, status: ChunkStatus) -> Result<Vec<ChunkRecord>> {
        ChunkQueries::list_by_status(&self.pool, status).await
    }

    pub async fn count_chunks_by_status(&self, status: ChunkStatus) -> Result<i64> {
        ChunkQueries::count_by_status(&self.pool, status).await
    }

    pub async fn active_internal_ids(&self) -> Result<Vec<i64>> {
        ChunkQueries::active_internal_ids(&self.pool).await
    }

    // Index metadata operations
    pub async fn ensure_index_meta(&self, dimension: i64) -> Result<IndexMeta> {
        IndexMetaQueries::ensure(&self.pool, dimension).await
    }

    pub async fn index_meta(&self) -> Result<IndexMeta> {
        IndexMetaQueries::get(&self.pool).await
    }

    pub async fn bump_generation(&self) -> Result<i64> {
        IndexMetaQueries::bump_generation(&self.pool).await
    }

    pub async fn set_rebuild_required(&self, required: bool) -> Result<()> {
        IndexMetaQueries::set_rebuild_required(&self.pool, required).await
    }

    pub async fn set_index_dimension(&self, dimension: i64) -> Result<()> {
        IndexMetaQueries::set_dimension(&self.pool, dimension).await
    }
}
