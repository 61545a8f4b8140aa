
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheLayer;
use crate::config::{Config, InferenceConfig};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceErrorKind {
    /// The call exceeded its deadline. Retryable.
    Timeout,
    /// The gateway asked us to back off. Retryable.
    RateLimited,
    /// Bad request, auth failure or policy rejection. Never retried.
    Invalid,
    /// Transport failure or server error. Retryable.
    Unavailable,
}

impl InferenceErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, InferenceErrorKind::Invalid)
    }
}

impl fmt::Display for InferenceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            InferenceErrorKind::Timeout => write!(f, "timeout"),
            InferenceErrorKind::RateLimited => write!(f, "rate limited"),
            InferenceErrorKind::Invalid => write!(f, "invalid"),
            InferenceErrorKind::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("inference {kind}: {message}")]
pub struct InferenceError {
    pub kind: InferenceErrorKind,
    pub message: String,
}

impl InferenceError {
    pub fn new(kind: InferenceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The three request kinds the engine issues against the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceRequest {
    Embed { text: String },
    Classify { model: String, text: String },
    Generate { prompt: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceResponse {
    Embedding(Vec<f32>),
    Classification(Classification),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Serialize)]
struct EmbedApiRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedApiResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct ClassifyApiRequest<'a> {
    model: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerateApiRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateApiResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
}

/// Resilient client for the external inference gateway.
///
/// Every call carries a per-call timeout and retries transient failures with
/// exponential backoff plus jitter; permanent failures surface immediately.
/// Successful embed and classify responses are memoized in the shared cache,
/// keyed by a hash of the normalized input and model identifier.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    base_url: Url,
    config: InferenceConfig,
    agent: ureq::Agent,
    cache: Arc<CacheLayer<InferenceResponse>>,
    cache_ttl: Duration,
    telemetry: Arc<Telemetry>,
}

impl InferenceClient {
    pub fn new(config: &Config, telemetry: Arc<Telemetry>) -> anyhow::Result<Self> {
        let base_url = config
            .inference
            .gateway_url()
            .map_err(|e| anyhow::anyhow!("Failed to build inference gateway URL: {}", e))?;

        let agent = build_agent(Duration::from_secs(config.inference.timeout_seconds));

        Ok(Self {
            base_url,
            config: config.inference.clone(),
            agent,
            cache: Arc::new(CacheLayer::new(config.cache.capacity)),
            cache_ttl: Duration::from_secs(config.cache.ttl_seconds),
            telemetry,
        })
    }

    /// Rebuild the agent with a different per-call timeout, e.g. to fit the
    /// remaining request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    pub fn embed_model(&self) -> &str {
        &self.config.embed_model
    }

    pub fn classify_model(&self) -> &str {
        &self.config.classify_model
    }

    pub fn sentiment_model(&self) -> &str {
        &self.config.sentiment_model
    }

    /// Verify the gateway is reachable and serves the configured models.
    pub fn health_check(&self) -> Result<(), InferenceError> {
        self.ping()?;

        let models = self.list_models()?;
        let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();

        for model in [
            &self.config.embed_model,
            &self.config.classify_model,
            &self.config.sentiment_model,
            &self.config.generate_model,
        ] {
            if !available.contains(&model.as_str()) {
                warn!("Model {} not served. Available: {:?}", model, available);
                return Err(InferenceError::new(
                    InferenceErrorKind::Invalid,
                    format!("model '{}' is not served by the gateway", model),
                ));
            }
        }

        debug!("Inference gateway health check passed");
        Ok(())
    }

    pub fn ping(&self) -> Result<(), InferenceError> {
        let url = self.endpoint("/v1/health")?;
        self.request_with_retry("ping", || {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;
        Ok(())
    }

    pub fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = self.endpoint("/v1/models")?;
        let body = self.request_with_retry("list_models", || {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: ModelsResponse = parse_body(&body)?;
        Ok(response.models)
    }

    /// Uniform entry point for all three request kinds.
    pub fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        match request {
            InferenceRequest::Embed { text } => self.embed(text).map(InferenceResponse::Embedding),
            InferenceRequest::Classify { model, text } => self
                .classify(model, text)
                .map(InferenceResponse::Classification),
            InferenceRequest::Generate { prompt } => {
                self.generate(prompt).map(InferenceResponse::Text)
            }
        }
    }

    /// Generate an embedding, consulting the cache before any network
    /// attempt.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        let key = cache_key("embed", &self.config.embed_model, text);

        if let Some(cached) = self.cache_lookup(&key) {
            if let InferenceResponse::Embedding(vector) = cached {
                return Ok(vector);
            }
        }

        let mut embeddings = self.embed_uncached(&[text])?;
        let vector = embeddings.pop().ok_or_else(|| {
            InferenceError::new(
                InferenceErrorKind::Unavailable,
                "gateway returned no embedding",
            )
        })?;

        self.cache.put(
            key,
            InferenceResponse::Embedding(vector.clone()),
            self.cache_ttl,
        );
        Ok(vector)
    }

    /// Batch embedding generation. Cached texts are served from memory; only
    /// misses are sent over the wire, split by the configured batch size.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (index, text) in texts.iter().enumerate() {
            let key = cache_key("embed", &self.config.embed_model, text);
            match self.cache_lookup(&key) {
                Some(InferenceResponse::Embedding(vector)) => results[index] = Some(vector),
                _ => misses.push(index),
            }
        }

        for batch in misses.chunks(self.config.batch_size as usize) {
            let batch_texts: Vec<&str> = batch.iter().map(|&i| texts[i].as_str()).collect();
            let embeddings = self.embed_uncached(&batch_texts)?;

            for (&index, vector) in batch.iter().zip(embeddings) {
                let key = cache_key("embed", &self.config.embed_model, &texts[index]);
                self.cache.put(
                    key,
                    InferenceResponse::Embedding(vector.clone()),
                    self.cache_ttl,
                );
                results[index] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|entry| {
                entry.ok_or_else(|| {
                    InferenceError::new(
                        InferenceErrorKind::Unavailable,
                        "gateway returned fewer embeddings than requested",
                    )
                })
            })
            .collect()
    }

    fn embed_uncached(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, InferenceError> {
        let url = self.endpoint("/v1/embed")?;
        let request = EmbedApiRequest {
            model: &self.config.embed_model,
            input: texts.to_vec(),
        };
        let request_json = serialize_body(&request)?;

        let body = self.request_with_retry("embed", || {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: EmbedApiResponse = parse_body(&body)?;

        if response.embeddings.len() != texts.len() {
            return Err(InferenceError::new(
                InferenceErrorKind::Unavailable,
                format!(
                    "embedding count mismatch: requested {}, received {}",
                    texts.len(),
                    response.embeddings.len()
                ),
            ));
        }

        Ok(response.embeddings)
    }

    /// Text classification against a named model, cached like embeddings.
    pub fn classify(&self, model: &str, text: &str) -> Result<Classification, InferenceError> {
        let key = cache_key("classify", model, text);

        if let Some(InferenceResponse::Classification(cached)) = self.cache_lookup(&key) {
            return Ok(cached);
        }

        let url = self.endpoint("/v1/classify")?;
        let request = ClassifyApiRequest { model, text };
        let request_json = serialize_body(&request)?;

        let body = self.request_with_retry("classify", || {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let classification: Classification = parse_body(&body)?;

        self.cache.put(
            key,
            InferenceResponse::Classification(classification.clone()),
            self.cache_ttl,
        );
        Ok(classification)
    }

    /// Free-text generation. Not cached: prompts embed per-request context.
    pub fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        let url = self.endpoint("/v1/generate")?;
        let request = GenerateApiRequest {
            model: &self.config.generate_model,
            prompt,
        };
        let request_json = serialize_body(&request)?;

        let body = self.request_with_retry("generate", || {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: GenerateApiResponse = parse_body(&body)?;
        Ok(response.text)
    }

    fn cache_lookup(&self, key: &str) -> Option<InferenceResponse> {
        match self.cache.get(key) {
            Some(value) => {
                self.telemetry.record_cache_hit();
                Some(value)
            }
            None => {
                self.telemetry.record_cache_miss();
                None
            }
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, InferenceError> {
        self.base_url.join(path).map_err(|e| {
            InferenceError::new(
                InferenceErrorKind::Invalid,
                format!("failed to build gateway URL for {}: {}", path, e),
            )
        })
    }

    fn request_with_retry<F>(&self, operation: &str, mut request_fn: F) -> Result<String, InferenceError>
    where
        F: FnMut() -> Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 0..self.config.max_retries {
            self.telemetry.record_inference_attempt();
            let started = Instant::now();

            match request_fn() {
                Ok(body) => {
                    debug!(
                        operation,
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        outcome = "ok",
                        "inference request succeeded"
                    );
                    return Ok(body);
                }
                Err(error) => {
                    let inference_error = classify_transport_error(&error);
                    warn!(
                        operation,
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        outcome = %inference_error.kind,
                        "inference request failed: {}",
                        inference_error.message
                    );

                    if !inference_error.kind.is_retryable() {
                        self.telemetry.record_inference_failure();
                        return Err(inference_error);
                    }

                    last_error = Some(inference_error);

                    if attempt + 1 < self.config.max_retries {
                        self.telemetry.record_inference_retry();
                        let delay = self.backoff_delay(attempt);
                        debug!(operation, "waiting {:?} before retry", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        self.telemetry.record_inference_failure();
        Err(last_error.unwrap_or_else(|| {
            InferenceError::new(
                InferenceErrorKind::Unavailable,
                format!("{} failed after retries", operation),
            )
        }))
    }

    /// `base * 2^attempt + jitter`, capped at the configured maximum.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=self.config.base_backoff_ms);
        Duration::from_millis(exponential.saturating_add(jitter).min(self.config.max_backoff_ms))
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

fn classify_transport_error(error: &ureq::Error) -> InferenceError {
    match error {
        ureq::Error::StatusCode(status) => {
            if *status == 429 {
                InferenceError::new(
                    InferenceErrorKind::RateLimited,
                    format!("gateway rate limited the request (HTTP {})", status),
                )
            } else if *status >= 500 {
                InferenceError::new(
                    InferenceErrorKind::Unavailable,
                    format!("gateway server error (HTTP {})", status),
                )
            } else {
                InferenceError::new(
                    InferenceErrorKind::Invalid,
                    format!("gateway rejected the request (HTTP {})", status),
                )
            }
        }
        ureq::Error::Timeout(_) => {
            InferenceError::new(InferenceErrorKind::Timeout, "request timed out")
        }
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound | ureq::Error::Io(_) => {
            InferenceError::new(
                InferenceErrorKind::Unavailable,
                format!("transport error: {}", error),
            )
        }
        _ => InferenceError::new(
            InferenceErrorKind::Invalid,
            format!("non-retryable error: {}", error),
        ),
    }
}

fn serialize_body<T: Serialize>(request: &T) -> Result<String, InferenceError> {
    serde_json::to_string(request).map_err(|e| {
        InferenceError::new(
            InferenceErrorKind::Invalid,
            format!("failed to serialize request: {}", e),
        )
    })
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, InferenceError> {
    serde_json::from_str(body).map_err(|e| {
        InferenceError::new(
            InferenceErrorKind::Invalid,
            format!("failed to parse gateway response: {}", e),
        )
    })
}

/// Deterministic cache key: request kind, model id and a hash of the
/// whitespace-normalized input.
pub fn cache_key(kind: &str, model: &str, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}:{}:{}", kind, model, blake3::hash(normalized.as_bytes()).to_hex())
}
