use super::*;
use crate::config::Config;
use crate::store::metadata::models::NewChunk;
use crate::telemetry::Telemetry;
use tempfile::TempDir;

async fn test_coordinator(dir: &TempDir) -> VectorStoreCoordinator {
    let mut config = Config::load(dir.path()).expect("Failed to load config");
    config.index.dimension = 3;
    VectorStoreCoordinator::open(&config, Telemetry::new())
        .await
        .expect("Failed to open coordinator")
}

fn chunk(offset: i64, embedding: Vec<f32>) -> (NewChunk, Vec<f32>) {
    (
        NewChunk {
            document_id: "doc".to_string(),
            chunk_offset: offset,
            content: format!("clause at {}", offset),
            token_count: 3,
            policy_type: None,
            embedding: embedding.clone(),
        },
        embedding,
    )
}

#[tokio::test]
async fn healthy_stores_validate_clean() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let coordinator = test_coordinator(&dir).await;

    coordinator
        .index("doc", vec![chunk(0, vec![1.0, 0.0, 0.0])])
        .await
        .expect("index failed");

    let report = ConsistencyValidator::new(&coordinator)
        .validate()
        .await
        .expect("validate failed");

    assert!(report.is_consistent);
    assert_eq!(report.metadata_chunks, 1);
    assert_eq!(report.index_rows, 1);
}

#[tokio::test]
async fn missing_vector_is_reported_and_repaired() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let coordinator = test_coordinator(&dir).await;
    let db = coordinator.db();

    db.upsert_document("doc").await.expect("upsert failed");
    let (record, _) = db
        .insert_chunk(NewChunk {
            document_id: "doc".to_string(),
            chunk_offset: 0,
            content: "unindexed clause".to_string(),
            token_count: 2,
            policy_type: None,
            embedding: vec![0.0, 1.0, 0.0],
        })
        .await
        .expect("insert failed");

    let validator = ConsistencyValidator::new(&coordinator);
    let report = validator.validate().await.expect("validate failed");
    assert!(!report.is_consistent);
    assert_eq!(report.missing_in_index, vec![record.internal_id]);
    assert!(report.awaiting_promotion.is_empty());

    let repair = validator.repair().await.expect("repair failed");
    assert_eq!(repair.reinserted, 1);
    assert_eq!(repair.orphans_removed, 0);

    let report = validator.validate().await.expect("validate failed");
    assert!(report.is_consistent);

    let results = coordinator
        .search(&[0.0, 1.0, 0.0], 1)
        .await
        .expect("search failed");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, "unindexed clause");
}

#[tokio::test]
async fn interrupted_promotion_is_finished_without_a_second_append() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let coordinator = test_coordinator(&dir).await;
    let db = coordinator.db();

    // A write that died between the ANN append and the status promotion:
    // the row is still pending but its vector is already in the index.
    db.upsert_document("doc").await.expect("upsert failed");
    let (record, _) = db
        .insert_chunk(NewChunk {
            document_id: "doc".to_string(),
            chunk_offset: 0,
            content: "half-promoted clause".to_string(),
            token_count: 2,
            policy_type: None,
            embedding: vec![1.0, 0.0, 0.0],
        })
        .await
        .expect("insert failed");
    coordinator
        .ann()
        .add_batch(&[(record.internal_id, vec![1.0, 0.0, 0.0])])
        .await
        .expect("add failed");

    let validator = ConsistencyValidator::new(&coordinator);
    let report = validator.validate().await.expect("validate failed");
    assert!(!report.is_consistent);
    assert_eq!(report.awaiting_promotion, vec![record.internal_id]);
    assert!(report.missing_in_index.is_empty());

    let repair = validator.repair().await.expect("repair failed");
    assert_eq!(repair.promoted, 1);
    assert_eq!(repair.reinserted, 0);

    assert_eq!(coordinator.ann().count().await.expect("count failed"), 1);
    assert!(
        validator
            .validate()
            .await
            .expect("validate failed")
            .is_consistent
    );

    let results = coordinator
        .search(&[1.0, 0.0, 0.0], 5)
        .await
        .expect("search failed");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].internal_id, record.internal_id);
}

#[tokio::test]
async fn orphaned_index_row_is_removed() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let coordinator = test_coordinator(&dir).await;

    coordinator
        .ann()
        .add_batch(&[(424_242, vec![0.5, 0.5, 0.0])])
        .await
        .expect("add failed");

    let validator = ConsistencyValidator::new(&coordinator);
    let report = validator.validate().await.expect("validate failed");
    assert_eq!(report.orphaned_in_index, vec![424_242]);

    let repair = validator.repair().await.expect("repair failed");
    assert_eq!(repair.orphans_removed, 1);

    assert_eq!(coordinator.ann().count().await.expect("count failed"), 0);
    assert!(
        validator
            .validate()
            .await
            .expect("validate failed")
            .is_consistent
    );
}

#[tokio::test]
async fn repair_clears_rebuild_flag() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let coordinator = test_coordinator(&dir).await;

    coordinator
        .db()
        .set_rebuild_required(true)
        .await
        .expect("flag failed");

    ConsistencyValidator::new(&coordinator)
        .repair()
        .await
        .expect("repair failed");

    assert!(
        !coordinator
            .db()
            .index_meta()
            .await
            .expect("meta failed")
            .rebuild_required
    );
}

#[tokio::test]
async fn drifted_dimension_is_not_reinserted() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let coordinator = test_coordinator(&dir).await;
    let db = coordinator.db();

    db.upsert_document("doc").await.expect("upsert failed");
    let (record, _) = db
        .insert_chunk(NewChunk {
            document_id: "doc".to_string(),
            chunk_offset: 0,
            content: "stale embedding".to_string(),
            token_count: 2,
            policy_type: None,
            embedding: vec![0.0, 1.0],
        })
        .await
        .expect("insert failed");

    let validator = ConsistencyValidator::new(&coordinator);
    let report = validator.validate().await.expect("validate failed");
    assert_eq!(report.dimension_drift, vec![record.internal_id]);
    assert!(report.missing_in_index.is_empty());

    let repair = validator.repair().await.expect("repair failed");
    assert_eq!(repair.reinserted, 0);
    assert_eq!(repair.drift_remaining, 1);
    assert_eq!(coordinator.ann().count().await.expect("count failed"), 0);
}
