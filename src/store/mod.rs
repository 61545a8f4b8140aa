
pub mod ann;
pub mod metadata;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::CacheLayer;
use crate::config::{Config, DistanceMetric};
use crate::store::ann::{AnnError, AnnStore};
use crate::store::metadata::Database;
use crate::store::metadata::models::{ChunkStatus, NewChunk, encode_embedding};
use crate::telemetry::Telemetry;
use crate::{EngineError, Result};

/// A chunk returned from retrieval, metadata joined back from SQLite.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub internal_id: i64,
    pub document_id: String,
    pub chunk_offset: i64,
    pub content: String,
    pub policy_type: Option<String>,
    pub distance: f32,
}

impl RetrievedChunk {
    pub fn chunk_id(&self) -> String {
        format!("{}@{}", self.document_id, self.chunk_offset)
    }
}

/// Optional metadata constraints applied to search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub document_id: Option<String>,
    pub policy_type: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.policy_type.is_none()
    }

    fn matches(&self, document_id: &str, policy_type: Option<&str>) -> bool {
        if let Some(want) = &self.document_id {
            if want != document_id {
                return false;
            }
        }
        if let Some(want) = &self.policy_type {
            if policy_type != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReceipt {
    pub document_id: String,
    pub chunks_indexed: usize,
    pub chunks_skipped: usize,
    pub generation: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: i64,
    pub active_chunks: i64,
    pub pending_chunks: i64,
    pub pending_repair_chunks: i64,
    pub ann_rows: u64,
    pub generation: i64,
    pub dimension: usize,
    pub rebuild_required: bool,
}

/// Fan-out over ANN search keeps headroom for rows filtered out by the
/// metadata join.
const SEARCH_OVERFETCH: usize = 4;

/// Coordinates the metadata store and the approximate index.
///
/// Writes are two-phase: a chunk lands in SQLite as `pending`, is appended
/// to the ANN table, then promoted to `active`. A failed append leaves the
/// row in `pending_repair`, excluded from results until the consistency
/// validator re-adds it. Reads join ANN matches back against metadata and
/// fall back to a brute-force scan of active rows when the ANN table is
/// empty.
pub struct VectorStoreCoordinator {
    db: Database,
    ann: AnnStore,
    metric: DistanceMetric,
    dimension: usize,
    write_lock: Mutex<()>,
    retrieval_cache: CacheLayer<Vec<RetrievedChunk>>,
    cache_ttl: Duration,
    epoch: AtomicU64,
    telemetry: Arc<Telemetry>,
}

impl VectorStoreCoordinator {
    pub async fn open(config: &Config, telemetry: Arc<Telemetry>) -> Result<Self> {
        let dimension = config.index.dimension as usize;
        let db = Database::initialize_from_base_dir(&config.base_dir)
            .await
            .map_err(|e| EngineError::Metadata(e.to_string()))?;
        db.ensure_index_meta(dimension as i64)
            .await
            .map_err(|e| EngineError::Metadata(e.to_string()))?;

        let index_path = config.ann_index_path();
        let ann = match AnnStore::open(&index_path, dimension, config.index.metric).await {
            Ok(ann) => ann,
            Err(AnnError::DimensionMismatch { expected, found }) => {
                warn!(
                    "ANN index holds {}-d vectors but {} is configured, quarantining",
                    found, expected
                );
                let quarantine_path = index_path.with_file_name(format!(
                    "vectors.quarantine-{}",
                    Utc::now().format("%Y%m%d%H%M%S")
                ));
                std::fs::rename(&index_path, &quarantine_path)?;
                db.set_rebuild_required(true)
                    .await
                    .map_err(|e| EngineError::Metadata(e.to_string()))?;
                db.set_index_dimension(dimension as i64)
                    .await
                    .map_err(|e| EngineError::Metadata(e.to_string()))?;
                info!("Quarantined index to {:?}", quarantine_path);
                AnnStore::open(&index_path, dimension, config.index.metric).await?
            }
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            db,
            ann,
            metric: config.index.metric,
            dimension,
            write_lock: Mutex::new(()),
            retrieval_cache: CacheLayer::new(config.cache.capacity),
            cache_ttl: Duration::from_secs(config.cache.ttl_seconds),
            epoch: AtomicU64::new(0),
            telemetry,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn ann(&self) -> &AnnStore {
        &self.ann
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Index a document's chunks. Re-submitting already-active chunks is a
    /// no-op counted in `chunks_skipped`.
    pub async fn index(
        &self,
        document_id: &str,
        chunks: Vec<(NewChunk, Vec<f32>)>,
    ) -> Result<IndexReceipt> {
        for (chunk, vector) in &chunks {
            if vector.len() != self.dimension {
                return Err(EngineError::Index(format!(
                    "embedding for {}@{} has dimension {}, index expects {}",
                    chunk.document_id, chunk.chunk_offset, vector.len(), self.dimension
                )));
            }
        }

        let _guard = self.write_lock.lock().await;

        self.db
            .upsert_document(document_id)
            .await
            .map_err(|e| EngineError::Metadata(e.to_string()))?;

        let mut to_index = Vec::new();
        let mut resubmitted = Vec::new();
        let mut skipped = 0;

        for (chunk, vector) in chunks {
            let (record, inserted) = self
                .db
                .insert_chunk(chunk)
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?;

            if !inserted {
                if record.status == ChunkStatus::Active {
                    skipped += 1;
                    continue;
                }
                resubmitted.push(record.internal_id);
            }
            to_index.push((record.internal_id, vector));
        }

        if to_index.is_empty() {
            let meta = self
                .db
                .index_meta()
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?;
            return Ok(IndexReceipt {
                document_id: document_id.to_string(),
                chunks_indexed: 0,
                chunks_skipped: skipped,
                generation: meta.generation,
            });
        }

        // A crash between the ANN append and the status promotion leaves a
        // pending row with a live index entry; drop it before re-appending.
        self.ann.delete_ids(&resubmitted).await?;

        if let Err(error) = self.ann.add_batch(&to_index).await {
            for (internal_id, _) in &to_index {
                self.db
                    .set_chunk_status(*internal_id, ChunkStatus::PendingRepair)
                    .await
                    .map_err(|e| EngineError::Metadata(e.to_string()))?;
            }
            return Err(EngineError::IndexInconsistency(format!(
                "index append failed for document '{}', {} chunks parked for repair: {}",
                document_id,
                to_index.len(),
                error
            )));
        }

        for (internal_id, _) in &to_index {
            self.db
                .set_chunk_status(*internal_id, ChunkStatus::Active)
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?;
        }

        let generation = self
            .db
            .bump_generation()
            .await
            .map_err(|e| EngineError::Metadata(e.to_string()))?;
        self.epoch.fetch_add(1, Ordering::Relaxed);

        info!(
            "Indexed {} chunks for document '{}' ({} skipped), generation {}",
            to_index.len(),
            document_id,
            skipped,
            generation
        );

        Ok(IndexReceipt {
            document_id: document_id.to_string(),
            chunks_indexed: to_index.len(),
            chunks_skipped: skipped,
            generation,
        })
    }

    /// Top-k retrieval, deterministic: ties on distance break toward the
    /// lower internal id.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        self.search_filtered(query, k, &SearchFilter::default())
            .await
    }

    /// Top-k retrieval constrained to chunks whose metadata matches the
    /// filter. ANN matches are post-filtered against the metadata join; the
    /// fallback scan applies the same constraints.
    pub async fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        if query.len() != self.dimension {
            return Err(EngineError::Index(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        self.telemetry.record_search();

        let cache_key = self.search_cache_key(query, k, filter);
        if let Some(cached) = self.retrieval_cache.get(&cache_key) {
            debug!("retrieval cache hit");
            return Ok(cached);
        }

        let matches = self.ann.search(query, k * SEARCH_OVERFETCH).await?;

        let mut results = if matches.is_empty() {
            self.fallback_scan(query, filter).await?
        } else {
            let ids: Vec<i64> = matches.iter().map(|m| m.internal_id).collect();
            let records = self
                .db
                .get_chunks_by_internal_ids(&ids)
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?;

            let joined: Vec<RetrievedChunk> = matches
                .into_iter()
                .filter_map(|m| {
                    records
                        .iter()
                        .find(|r| {
                            r.internal_id == m.internal_id
                                && r.status == ChunkStatus::Active
                                && filter.matches(&r.document_id, r.policy_type.as_deref())
                        })
                        .map(|r| RetrievedChunk {
                            internal_id: r.internal_id,
                            document_id: r.document_id.clone(),
                            chunk_offset: r.chunk_offset,
                            content: r.content.clone(),
                            policy_type: r.policy_type.clone(),
                            distance: m.distance,
                        })
                })
                .collect();

            // A selective filter can reject the whole over-fetch window even
            // though matching rows exist further out; the scan is exact.
            if joined.len() < k && !filter.is_empty() {
                self.fallback_scan(query, filter).await?
            } else {
                joined
            }
        };

        results.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.internal_id.cmp(&b.internal_id))
        });
        results.truncate(k);

        self.retrieval_cache
            .put(cache_key, results.clone(), self.cache_ttl);
        Ok(results)
    }

    /// Exhaustive scan over active rows, used while the ANN table is empty
    /// (fresh install or quarantined index awaiting repair) and when a
    /// filter leaves the ANN over-fetch short of k.
    async fn fallback_scan(
        &self,
        query: &[f32],
        filter: &SearchFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        self.telemetry.record_fallback_scan();
        debug!("scanning active chunks");

        let records = self
            .db
            .chunks_by_status(ChunkStatus::Active)
            .await
            .map_err(|e| EngineError::Metadata(e.to_string()))?;

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if record.dimension as usize != query.len()
                || !filter.matches(&record.document_id, record.policy_type.as_deref())
            {
                continue;
            }
            let vector = record
                .vector()
                .map_err(|e| EngineError::Metadata(e.to_string()))?;
            let distance = match self.metric {
                DistanceMetric::L2 => l2_squared(query, &vector),
                DistanceMetric::Cosine => cosine_distance(query, &vector),
            };
            results.push(RetrievedChunk {
                internal_id: record.internal_id,
                document_id: record.document_id,
                chunk_offset: record.chunk_offset,
                content: record.content,
                policy_type: record.policy_type,
                distance,
            });
        }

        Ok(results)
    }

    fn search_cache_key(&self, query: &[f32], k: usize, filter: &SearchFilter) -> String {
        let epoch = self.epoch.load(Ordering::Relaxed);
        let hash = blake3::hash(&encode_embedding(query));
        format!(
            "search:{}:{}:{}:{}:{}",
            epoch,
            k,
            filter.document_id.as_deref().unwrap_or(""),
            filter.policy_type.as_deref().unwrap_or(""),
            hash.to_hex()
        )
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let meta = self
            .db
            .index_meta()
            .await
            .map_err(|e| EngineError::Metadata(e.to_string()))?;

        Ok(StoreStats {
            documents: self
                .db
                .count_documents()
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?,
            active_chunks: self
                .db
                .count_chunks_by_status(ChunkStatus::Active)
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?,
            pending_chunks: self
                .db
                .count_chunks_by_status(ChunkStatus::Pending)
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?,
            pending_repair_chunks: self
                .db
                .count_chunks_by_status(ChunkStatus::PendingRepair)
                .await
                .map_err(|e| EngineError::Metadata(e.to_string()))?,
            ann_rows: self.ann.count().await?,
            generation: meta.generation,
            dimension: self.dimension,
            rebuild_required: meta.rebuild_required,
        })
    }

    /// Drop cached retrieval results, e.g. after a consistency repair.
    pub fn invalidate_retrieval_cache(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
        self.retrieval_cache.clear();
    }
}

/// Squared L2, matching the distance LanceDB reports for the L2 metric.
fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}
