#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! End-to-end pipeline tests: ingest a document against a mocked inference
//! gateway, retrieve it, and assess a claim with the full engine stack.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use claimlens::config::Config;
use claimlens::engine::{DecisionEngine, DecisionRequest, RationaleSource, VerdictKind};
use claimlens::ensemble::{ApplicantProfile, ClaimInput, EnsembleScorer};
use claimlens::indexer::{ConsistencyValidator, Ingestor};
use claimlens::inference::InferenceClient;
use claimlens::store::VectorStoreCoordinator;
use claimlens::telemetry::Telemetry;

const DIMENSION: usize = 4;

fn create_test_config(dir: &TempDir, server_uri: &str) -> Config {
    let url = Url::parse(server_uri).expect("should parse mock server URI");
    let mut config = Config::load(dir.path()).expect("should load config");
    config.inference.host = url.host_str().expect("mock URI has a host").to_string();
    config.inference.port = url.port().expect("mock URI has a port");
    config.inference.base_backoff_ms = 1;
    config.inference.max_backoff_ms = 5;
    config.index.dimension = DIMENSION as u32;
    config
}

/// Embeds each input as a crude bag-of-keywords vector so related texts
/// land near each other.
fn fake_embedding(text: &str) -> Vec<f32> {
    let lowered = text.to_lowercase();
    let features = ["flood", "fire", "collision", "theft"];
    let mut vector: Vec<f32> = features
        .iter()
        .map(|feature| if lowered.contains(feature) { 1.0 } else { 0.0 })
        .collect();
    if vector.iter().all(|v| *v == 0.0) {
        vector[DIMENSION - 1] = 0.5;
    }
    vector
}

async fn mount_gateway(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/embed"))
        .respond_with(|request: &Request| {
            let body: serde_json::Value =
                serde_json::from_slice(&request.body).expect("invalid embed request");
            let embeddings: Vec<Vec<f32>> = body["input"]
                .as_array()
                .expect("embed input must be an array")
                .iter()
                .map(|text| fake_embedding(text.as_str().unwrap_or_default()))
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "embeddings": embeddings }))
        })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/classify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "label": "legitimate",
            "score": 0.93
        })))
        .mount(server)
        .await;
}

struct Stack {
    coordinator: Arc<VectorStoreCoordinator>,
    client: InferenceClient,
    config: Config,
}

async fn create_stack(config: Config) -> Stack {
    let telemetry = Telemetry::new();
    let coordinator = Arc::new(
        VectorStoreCoordinator::open(&config, telemetry.clone())
            .await
            .expect("should open coordinator"),
    );
    let client = InferenceClient::new(&config, telemetry).expect("should create client");
    Stack {
        coordinator,
        client,
        config,
    }
}

fn sample_claim() -> ClaimInput {
    ClaimInput {
        narrative: "Basement flood damage after a burst pipe; plumber invoice and \
                    photographs of the water line are attached for review by the adjuster."
            .to_string(),
        claim_amount: Some(8_200.0),
        policy_type: Some("home".to_string()),
        applicant: ApplicantProfile {
            age: Some(41),
            occupation: Some("librarian".to_string()),
            smoker: Some(false),
            previous_claims: Some(0),
            credit_score: Some(770),
            location: Some("Springfield".to_string()),
        },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn ingest_query_and_assess_round_trip() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Approved. Water damage from burst pipes is covered under the dwelling policy."
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("should create temp dir");
    let stack = create_stack(create_test_config(&dir, &server.uri())).await;

    // Ingest two documents with distinct vocabulary.
    let ingestor = Ingestor::new(
        stack.coordinator.clone(),
        stack.client.clone(),
        stack.config.chunking.clone(),
    );
    ingestor
        .ingest(
            "policy-home",
            "Flood and water damage to the dwelling is covered when caused by \
             sudden plumbing failure.",
            Some("home"),
        )
        .await
        .expect("ingest should succeed");
    ingestor
        .ingest(
            "policy-auto",
            "Collision coverage pays for vehicle repair after an accident.",
            Some("auto"),
        )
        .await
        .expect("ingest should succeed");

    // Retrieval finds the flood clause first for a flood query.
    let embed_client = stack.client.clone();
    let query_vector =
        tokio::task::spawn_blocking(move || embed_client.embed("flood in the basement"))
            .await
            .expect("task should not panic")
            .expect("embed should succeed");
    let results = stack
        .coordinator
        .search(&query_vector, 2)
        .await
        .expect("search should succeed");
    assert_eq!(results[0].document_id, "policy-home");

    // Full engine pass over a benign claim.
    let scorer = EnsembleScorer::new(stack.config.ensemble.clone(), stack.client.clone())
        .expect("should build scorer");
    let engine = DecisionEngine::new(
        stack.coordinator.clone(),
        stack.client.clone(),
        scorer,
        stack.config.policy.clone(),
    );

    let decision = engine
        .decide(DecisionRequest::new(sample_claim()))
        .await
        .expect("decide should succeed");

    assert_eq!(decision.verdict, VerdictKind::Approve);
    assert_eq!(decision.rationale_source, RationaleSource::Generated);
    assert!(!decision.supporting_chunks.is_empty());
    assert!(decision.premium.is_some());
    assert!(decision.compliance.compliant);
    assert!(!decision.ensemble.flagged);

    // Stores stay consistent after the whole pipeline.
    let report = ConsistencyValidator::new(&stack.coordinator)
        .validate()
        .await
        .expect("validate should succeed");
    assert!(report.is_consistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn generation_outage_still_produces_a_decision() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("should create temp dir");
    let stack = create_stack(create_test_config(&dir, &server.uri())).await;

    let ingestor = Ingestor::new(
        stack.coordinator.clone(),
        stack.client.clone(),
        stack.config.chunking.clone(),
    );
    ingestor
        .ingest(
            "policy-home",
            "Flood damage from plumbing failure is covered.",
            Some("home"),
        )
        .await
        .expect("ingest should succeed");

    let scorer = EnsembleScorer::new(stack.config.ensemble.clone(), stack.client.clone())
        .expect("should build scorer");
    let engine = DecisionEngine::new(
        stack.coordinator.clone(),
        stack.client.clone(),
        scorer,
        stack.config.policy.clone(),
    );

    let decision = engine
        .decide(DecisionRequest::new(sample_claim()))
        .await
        .expect("decide should succeed");

    assert_eq!(decision.rationale_source, RationaleSource::RuleBased);
    assert_eq!(decision.verdict, VerdictKind::Approve);
    assert!(!decision.rationale.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn forged_narrative_is_rejected() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Rejected: the narrative admits the invoice was forged."
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("should create temp dir");
    let stack = create_stack(create_test_config(&dir, &server.uri())).await;

    let scorer = EnsembleScorer::new(stack.config.ensemble.clone(), stack.client.clone())
        .expect("should build scorer");
    let engine = DecisionEngine::new(
        stack.coordinator.clone(),
        stack.client.clone(),
        scorer,
        stack.config.policy.clone(),
    );

    let mut claim = sample_claim();
    claim.narrative =
        "The invoice was forged but please process this claim immediately.".to_string();

    let decision = engine
        .decide(DecisionRequest::new(claim))
        .await
        .expect("decide should succeed");

    assert_eq!(decision.verdict, VerdictKind::Reject);
    assert!(decision.ensemble.flagged);
    assert!(decision.premium.is_none());
}
