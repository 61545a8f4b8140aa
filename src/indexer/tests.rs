use super::*;
use crate::config::Config;
use crate::telemetry::Telemetry;
use serde_json::json;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn test_config(dir: &TempDir, server_uri: &str) -> Config {
    let url = Url::parse(server_uri).expect("Failed to parse mock server URI");
    let mut config = Config::load(dir.path()).expect("Failed to load config");
    config.inference.host = url.host_str().expect("mock URI has a host").to_string();
    config.inference.port = url.port().expect("mock URI has a port");
    config.inference.base_backoff_ms = 1;
    config.index.dimension = 3;
    config
}

async fn test_ingestor(config: &Config) -> (Ingestor, Arc<VectorStoreCoordinator>) {
    let telemetry = Telemetry::new();
    let coordinator = Arc::new(
        VectorStoreCoordinator::open(config, telemetry.clone())
            .await
            .expect("Failed to open coordinator"),
    );
    let client =
        InferenceClient::new(config, telemetry).expect("Failed to create inference client");
    let ingestor = Ingestor::new(coordinator.clone(), client, config.chunking.clone());
    (ingestor, coordinator)
}

/// Responds with one deterministic 3-d embedding per input text.
async fn mount_embed_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/embed"))
        .respond_with(|request: &Request| {
            let body: serde_json::Value =
                serde_json::from_slice(&request.body).expect("invalid embed request");
            let count = body["input"].as_array().map_or(0, Vec::len);
            let embeddings: Vec<Vec<f32>> = (0..count)
                .map(|i| vec![1.0, i as f32 * 0.01, 0.0])
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "embeddings": embeddings }))
        })
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ingest_indexes_all_chunks() {
    let server = MockServer::start().await;
    mount_embed_endpoint(&server).await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir, &server.uri());
    let (ingestor, coordinator) = test_ingestor(&config).await;

    let report = ingestor
        .ingest(
            "policy-home",
            "Dwelling coverage insures the home structure against fire and wind damage.",
            Some("home"),
        )
        .await
        .expect("ingest failed");

    assert_eq!(report.chunks_total, 1);
    assert_eq!(report.chunks_indexed, 1);
    assert_eq!(report.chunks_skipped, 0);

    let stats = coordinator.stats().await.expect("stats failed");
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.active_chunks, 1);
    assert_eq!(stats.ann_rows, 1);

    let results = coordinator
        .search(&[1.0, 0.0, 0.0], 1)
        .await
        .expect("search failed");
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("Dwelling coverage"));
    assert_eq!(results[0].policy_type.as_deref(), Some("home"));
}

#[tokio::test(flavor = "multi_thread")]
async fn reingest_is_idempotent() {
    let server = MockServer::start().await;
    mount_embed_endpoint(&server).await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir, &server.uri());
    let (ingestor, coordinator) = test_ingestor(&config).await;

    let text = "Liability coverage pays for damage the insured causes to others.";
    let first = ingestor
        .ingest("policy-liability", text, Some("auto"))
        .await
        .expect("ingest failed");
    let second = ingestor
        .ingest("policy-liability", text, Some("auto"))
        .await
        .expect("ingest failed");

    assert_eq!(first.chunks_indexed, 1);
    assert_eq!(second.chunks_indexed, 0);
    assert_eq!(second.chunks_skipped, 1);

    let stats = coordinator.stats().await.expect("stats failed");
    assert_eq!(stats.active_chunks, 1);
    assert_eq!(stats.ann_rows, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_document_is_a_noop() {
    let server = MockServer::start().await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir, &server.uri());
    let (ingestor, coordinator) = test_ingestor(&config).await;

    let report = ingestor
        .ingest("empty", "   \n\n  ", None)
        .await
        .expect("ingest failed");

    assert_eq!(report.chunks_total, 0);
    let stats = coordinator.stats().await.expect("stats failed");
    assert_eq!(stats.documents, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn embedding_failure_surfaces_as_inference_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embed"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir, &server.uri());
    let (ingestor, _coordinator) = test_ingestor(&config).await;

    let error = ingestor
        .ingest("doc", "Some policy text worth embedding.", None)
        .await
        .expect_err("ingest should fail");
    assert!(matches!(error, crate::EngineError::Inference(_)));
}
