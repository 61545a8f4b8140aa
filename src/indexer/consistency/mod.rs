#[cfg(test)]
mod tests;

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::Result;
use crate::store::VectorStoreCoordinator;
use crate::store::metadata::models::ChunkStatus;

/// Cross-store comparison between the metadata rows and the ANN index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub metadata_chunks: usize,
    pub index_rows: usize,
    /// Chunks the index should serve but does not: `pending` and
    /// `pending_repair` rows absent from the ANN table, plus active rows
    /// silently absent from it.
    pub missing_in_index: Vec<i64>,
    /// Non-active rows whose ANN append landed but whose status promotion
    /// did not, as after a crash mid-write; these need promotion only,
    /// never a second append.
    pub awaiting_promotion: Vec<i64>,
    /// ANN rows with no metadata backing.
    pub orphaned_in_index: Vec<i64>,
    /// Chunks whose stored embedding does not match the configured
    /// dimension; these need re-embedding, not re-insertion.
    pub dimension_drift: Vec<i64>,
    pub rebuild_required: bool,
    pub is_consistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub reinserted: usize,
    pub promoted: usize,
    pub orphans_removed: usize,
    pub drift_remaining: usize,
}

/// Validates and repairs the dual-store invariant: every active chunk is
/// present in the ANN index and every ANN row has a metadata record.
pub struct ConsistencyValidator<'a> {
    coordinator: &'a VectorStoreCoordinator,
}

impl<'a> ConsistencyValidator<'a> {
    #[inline]
    pub fn new(coordinator: &'a VectorStoreCoordinator) -> Self {
        Self { coordinator }
    }

    #[inline]
    pub async fn validate(&self) -> Result<ConsistencyReport> {
        info!("Starting cross-store consistency validation");
        let db = self.coordinator.db();
        let expected_dimension = self.coordinator.dimension() as i64;

        let active_ids = db
            .active_internal_ids()
            .await
            .map_err(|e| crate::EngineError::Metadata(e.to_string()))?;
        let index_ids = self.coordinator.ann().all_internal_ids().await?;
        let index_set: HashSet<i64> = index_ids.iter().copied().collect();

        let mut missing_in_index: Vec<i64> = Vec::new();
        let mut awaiting_promotion: Vec<i64> = Vec::new();
        let mut dimension_drift: Vec<i64> = Vec::new();

        for status in [ChunkStatus::Pending, ChunkStatus::PendingRepair] {
            for record in db
                .chunks_by_status(status)
                .await
                .map_err(|e| crate::EngineError::Metadata(e.to_string()))?
            {
                if record.dimension != expected_dimension {
                    dimension_drift.push(record.internal_id);
                } else if index_set.contains(&record.internal_id) {
                    awaiting_promotion.push(record.internal_id);
                } else {
                    missing_in_index.push(record.internal_id);
                }
            }
        }

        let metadata_ids: HashSet<i64> = active_ids.iter().copied().collect();
        for id in &active_ids {
            if !index_set.contains(id) {
                missing_in_index.push(*id);
            }
        }

        let orphaned_in_index: Vec<i64> = index_ids
            .iter()
            .filter(|id| !metadata_ids.contains(id))
            .copied()
            .collect();

        missing_in_index.sort_unstable();
        awaiting_promotion.sort_unstable();
        dimension_drift.sort_unstable();

        let rebuild_required = db
            .index_meta()
            .await
            .map_err(|e| crate::EngineError::Metadata(e.to_string()))?
            .rebuild_required;

        let is_consistent = missing_in_index.is_empty()
            && awaiting_promotion.is_empty()
            && orphaned_in_index.is_empty()
            && dimension_drift.is_empty();

        debug!(
            "consistency: {} missing, {} awaiting promotion, {} orphaned, {} drifted",
            missing_in_index.len(),
            awaiting_promotion.len(),
            orphaned_in_index.len(),
            dimension_drift.len()
        );

        Ok(ConsistencyReport {
            metadata_chunks: active_ids.len(),
            index_rows: index_ids.len(),
            missing_in_index,
            awaiting_promotion,
            orphaned_in_index,
            dimension_drift,
            rebuild_required,
            is_consistent,
        })
    }

    /// Re-insert missing vectors from the metadata embedding blobs, promote
    /// rows whose append already landed, remove orphaned index rows, and
    /// clear the rebuild flag once the stores converge. Drifted chunks are
    /// left parked for re-embedding.
    #[inline]
    pub async fn repair(&self) -> Result<RepairReport> {
        let report = self.validate().await?;
        let db = self.coordinator.db();

        if !report.orphaned_in_index.is_empty() {
            info!(
                "Removing {} orphaned index rows",
                report.orphaned_in_index.len()
            );
            self.coordinator
                .ann()
                .delete_ids(&report.orphaned_in_index)
                .await?;
        }

        let mut reinserted = 0;
        if !report.missing_in_index.is_empty() {
            let records = db
                .get_chunks_by_internal_ids(&report.missing_in_index)
                .await
                .map_err(|e| crate::EngineError::Metadata(e.to_string()))?;

            let mut rows = Vec::with_capacity(records.len());
            for record in &records {
                let vector = record
                    .vector()
                    .map_err(|e| crate::EngineError::Metadata(e.to_string()))?;
                rows.push((record.internal_id, vector));
            }

            self.coordinator.ann().add_batch(&rows).await?;
            for record in &records {
                db.set_chunk_status(record.internal_id, ChunkStatus::Active)
                    .await
                    .map_err(|e| crate::EngineError::Metadata(e.to_string()))?;
            }
            reinserted = records.len();
            info!("Re-inserted {} vectors from metadata blobs", reinserted);
        }

        for id in &report.awaiting_promotion {
            db.set_chunk_status(*id, ChunkStatus::Active)
                .await
                .map_err(|e| crate::EngineError::Metadata(e.to_string()))?;
        }
        if !report.awaiting_promotion.is_empty() {
            info!(
                "Promoted {} rows whose index append had already landed",
                report.awaiting_promotion.len()
            );
        }

        for id in &report.dimension_drift {
            db.set_chunk_status(*id, ChunkStatus::PendingRepair)
                .await
                .map_err(|e| crate::EngineError::Metadata(e.to_string()))?;
        }
        if !report.dimension_drift.is_empty() {
            warn!(
                "{} chunks have drifted dimensions and need re-embedding",
                report.dimension_drift.len()
            );
        }

        if report.dimension_drift.is_empty() {
            db.set_rebuild_required(false)
                .await
                .map_err(|e| crate::EngineError::Metadata(e.to_string()))?;
        }

        self.coordinator.invalidate_retrieval_cache();

        Ok(RepairReport {
            reinserted,
            promoted: report.awaiting_promotion.len(),
            orphans_removed: report.orphaned_in_index.len(),
            drift_remaining: report.dimension_drift.len(),
        })
    }
}
