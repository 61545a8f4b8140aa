use super::*;
use tempfile::TempDir;

async fn test_store(dir: &TempDir, dimension: usize) -> AnnStore {
    AnnStore::open(&dir.path().join("vectors"), dimension, DistanceMetric::L2)
        .await
        .expect("Failed to open ANN store")
}

#[tokio::test]
async fn open_creates_empty_table() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = test_store(&dir, 4).await;

    assert_eq!(store.dimension(), 4);
    assert_eq!(store.count().await.expect("count failed"), 0);
}

#[tokio::test]
async fn add_and_count_vectors() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = test_store(&dir, 3).await;

    store
        .add_batch(&[(1, vec![0.0, 0.0, 1.0]), (2, vec![1.0, 0.0, 0.0])])
        .await
        .expect("add failed");

    assert_eq!(store.count().await.expect("count failed"), 2);
    assert_eq!(
        store.all_internal_ids().await.expect("scan failed"),
        vec![1, 2]
    );
}

#[tokio::test]
async fn search_returns_nearest_first() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = test_store(&dir, 3).await;

    store
        .add_batch(&[
            (10, vec![1.0, 0.0, 0.0]),
            (20, vec![0.0, 1.0, 0.0]),
            (30, vec![0.9, 0.1, 0.0]),
        ])
        .await
        .expect("add failed");

    let matches = store
        .search(&[1.0, 0.0, 0.0], 2)
        .await
        .expect("search failed");

    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].internal_id, 10);
    assert_eq!(matches[1].internal_id, 30);
    assert!(matches[0].distance <= matches[1].distance);
}

#[tokio::test]
async fn wrong_dimension_vector_rejected() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = test_store(&dir, 3).await;

    let error = store
        .add_batch(&[(1, vec![0.5, 0.5])])
        .await
        .expect_err("add should fail");
    assert!(matches!(
        error,
        AnnError::DimensionMismatch {
            expected: 3,
            found: 2
        }
    ));

    let error = store
        .search(&[0.5, 0.5], 5)
        .await
        .expect_err("search should fail");
    assert!(matches!(error, AnnError::DimensionMismatch { .. }));
}

#[tokio::test]
async fn reopen_with_different_dimension_fails() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = test_store(&dir, 3).await;
        store
            .add_batch(&[(1, vec![0.0, 0.0, 1.0])])
            .await
            .expect("add failed");
    }

    let error = AnnStore::open(&dir.path().join("vectors"), 8, DistanceMetric::L2)
        .await
        .expect_err("open should fail");
    assert!(matches!(
        error,
        AnnError::DimensionMismatch {
            expected: 8,
            found: 3
        }
    ));
}

#[tokio::test]
async fn delete_removes_rows() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = test_store(&dir, 2).await;

    store
        .add_batch(&[(1, vec![0.0, 1.0]), (2, vec![1.0, 0.0]), (3, vec![0.5, 0.5])])
        .await
        .expect("add failed");

    store.delete_ids(&[1, 3]).await.expect("delete failed");

    assert_eq!(store.count().await.expect("count failed"), 1);
    assert_eq!(store.all_internal_ids().await.expect("scan failed"), vec![2]);
}

#[tokio::test]
async fn search_on_empty_table_is_empty() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = test_store(&dir, 2).await;

    let matches = store.search(&[0.1, 0.2], 5).await.expect("search failed");
    assert!(matches.is_empty());
}
