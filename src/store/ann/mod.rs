#[cfg(test)]
mod tests;

use arrow::array::{Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatchIterator};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::{
    Connection, DistanceType,
    query::{ExecutableQuery, QueryBase, Select},
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DistanceMetric;

const TABLE_NAME: &str = "vectors";

#[derive(Debug, Error)]
pub enum AnnError {
    #[error("index dimension mismatch: table holds {found}-d vectors, configured {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("{0}")]
    Database(String),
}

impl From<AnnError> for crate::EngineError {
    fn from(error: AnnError) -> Self {
        crate::EngineError::Index(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnMatch {
    pub internal_id: i64,
    pub distance: f32,
}

/// Approximate index over LanceDB. Rows carry nothing but the internal id
/// and the vector; all chunk metadata lives in SQLite, so this table is
/// disposable and rebuildable.
pub struct AnnStore {
    connection: Connection,
    dimension: usize,
    metric: DistanceMetric,
}

impl std::fmt::Debug for AnnStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnStore")
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .finish_non_exhaustive()
    }
}

impl AnnStore {
    /// Open or create the index at `path`. Fails with `DimensionMismatch`
    /// when an existing table disagrees with the configured dimension; the
    /// caller decides whether to quarantine.
    pub async fn open(
        path: &Path,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Self, AnnError> {
        debug!("Opening ANN index at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AnnError::Database(format!("Failed to create index directory: {}", e))
            })?;
        }

        let uri = format!("file://{}", path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to connect to LanceDB: {}", e)))?;

        let store = Self {
            connection,
            dimension,
            metric,
        };
        store.initialize_table().await?;

        Ok(store)
    }

    async fn initialize_table(&self) -> Result<(), AnnError> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to list tables: {}", e)))?;

        if table_names.contains(&TABLE_NAME.to_string()) {
            let found = self.detect_existing_dimension().await?;
            if found != self.dimension {
                return Err(AnnError::DimensionMismatch {
                    expected: self.dimension,
                    found,
                });
            }
            debug!("ANN table present with dimension {}", found);
            return Ok(());
        }

        self.connection
            .create_empty_table(TABLE_NAME, self.schema())
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to create table: {}", e)))?;

        info!("Created ANN table with dimension {}", self.dimension);
        Ok(())
    }

    async fn detect_existing_dimension(&self) -> Result<usize, AnnError> {
        let table = self
            .connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to open table: {}", e)))?;

        let schema = table
            .schema()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to get table schema: {}", e)))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(AnnError::Database(
            "Could not find vector column or determine dimension".to_string(),
        ))
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("internal_id", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.dimension as i32,
                ),
                false,
            ),
        ]))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn distance_type(&self) -> DistanceType {
        match self.metric {
            DistanceMetric::L2 => DistanceType::L2,
            DistanceMetric::Cosine => DistanceType::Cosine,
        }
    }

    /// Append a batch of `(internal_id, vector)` rows.
    pub async fn add_batch(&self, rows: &[(i64, Vec<f32>)]) -> Result<(), AnnError> {
        if rows.is_empty() {
            return Ok(());
        }

        for (internal_id, vector) in rows {
            if vector.len() != self.dimension {
                return Err(AnnError::DimensionMismatch {
                    expected: self.dimension,
                    found: vector.len(),
                });
            }
            debug!("queueing vector for internal_id {}", internal_id);
        }

        let record_batch = self.create_record_batch(rows)?;
        let schema = record_batch.schema();

        let table = self
            .connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to open table: {}", e)))?;

        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to insert vectors: {}", e)))?;

        debug!("Stored {} vectors", rows.len());
        Ok(())
    }

    fn create_record_batch(&self, rows: &[(i64, Vec<f32>)]) -> Result<RecordBatch, AnnError> {
        let mut ids = Vec::with_capacity(rows.len());
        let mut flat_values = Vec::with_capacity(rows.len() * self.dimension);
        for (internal_id, vector) in rows {
            ids.push(*internal_id);
            flat_values.extend_from_slice(vector);
        }

        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values_array),
            None,
        )
        .map_err(|e| AnnError::Database(format!("Failed to create vector array: {}", e)))?;

        let arrays: Vec<Arc<dyn Array>> =
            vec![Arc::new(Int64Array::from(ids)), Arc::new(vector_array)];

        RecordBatch::try_new(self.schema(), arrays)
            .map_err(|e| AnnError::Database(format!("Failed to create record batch: {}", e)))
    }

    /// Nearest neighbors under the configured metric, closest first.
    pub async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<AnnMatch>, AnnError> {
        if query.len() != self.dimension {
            return Err(AnnError::DimensionMismatch {
                expected: self.dimension,
                found: query.len(),
            });
        }

        let table = self
            .connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to open table: {}", e)))?;

        let mut stream = table
            .vector_search(query)
            .map_err(|e| AnnError::Database(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(self.distance_type())
            .limit(limit)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to execute search: {}", e)))?;

        let mut matches = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to read result stream: {}", e)))?
        {
            matches.extend(parse_search_batch(&batch)?);
        }

        debug!("ANN search returned {} matches", matches.len());
        Ok(matches)
    }

    /// Delete rows by internal id, used by the consistency repair path.
    pub async fn delete_ids(&self, ids: &[i64]) -> Result<(), AnnError> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self
            .connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to open table: {}", e)))?;

        let id_list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = format!("internal_id IN ({})", id_list);

        table
            .delete(&predicate)
            .await
            .map_err(|e| AnnError::Database(format!("Failed to delete vectors: {}", e)))?;

        debug!("Deleted {} vectors", ids.len());
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, AnnError> {
        let table = self
            .connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to open table: {}", e)))?;

        let count = table
            .count_rows(None)
            .await
            .map_err(|e| AnnError::Database(format!("Failed to count rows: {}", e)))?;

        Ok(count as u64)
    }

    /// All internal ids currently present in the index.
    pub async fn all_internal_ids(&self) -> Result<Vec<i64>, AnnError> {
        let table = self
            .connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to open table: {}", e)))?;

        let mut stream = table
            .query()
            .select(Select::columns(&["internal_id"]))
            .execute()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to scan index: {}", e)))?;

        let mut ids = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| AnnError::Database(format!("Failed to read scan stream: {}", e)))?
        {
            let column = batch
                .column_by_name("internal_id")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| AnnError::Database("Missing internal_id column".to_string()))?;
            for row in 0..batch.num_rows() {
                ids.push(column.value(row));
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }
}

fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<AnnMatch>, AnnError> {
    let ids = batch
        .column_by_name("internal_id")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| AnnError::Database("Missing internal_id column".to_string()))?;

    let distances = batch
        .column_by_name("_distance")
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

    let mut matches = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let distance = distances.map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });
        matches.push(AnnMatch {
            internal_id: ids.value(row),
            distance,
        });
    }

    Ok(matches)
}
