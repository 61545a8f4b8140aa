#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub embed_model: String,
    pub classify_model: String,
    pub sentiment_model: String,
    pub generate_model: String,
    pub batch_size: u32,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 8600,
            embed_model: "insure-embed-v1".to_string(),
            classify_model: "fraud-deberta-v3".to_string(),
            sentiment_model: "sentiment-distilbert".to_string(),
            generate_model: "underwriter-llm".to_string(),
            batch_size: 16,
            timeout_seconds: 30,
            max_retries: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in estimated tokens
    pub target_chunk_tokens: usize,
    /// Hard upper bound before forced splitting
    pub max_chunk_tokens: usize,
    /// Chunks smaller than this are merged into their neighbor
    pub min_chunk_tokens: usize,
    /// Overlap carried between adjacent chunks
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chunk_tokens: 500,
            max_chunk_tokens: 800,
            min_chunk_tokens: 50,
            overlap_tokens: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    L2,
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub dimension: u32,
    pub metric: DistanceMetric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            metric: DistanceMetric::L2,
        }
    }
}

/// Per-signal voting weight and the ceiling above which the signal flags the
/// input on its own, independent of the ensemble average.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SignalSettings {
    pub weight: f64,
    pub hard_ceiling: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnsembleConfig {
    pub flag_threshold: f64,
    pub signal_timeout_seconds: u64,
    pub signals: BTreeMap<String, SignalSettings>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        let mut signals = BTreeMap::new();
        signals.insert(
            "pattern".to_string(),
            SignalSettings {
                weight: 0.2,
                hard_ceiling: 0.6,
            },
        );
        signals.insert(
            "classifier".to_string(),
            SignalSettings {
                weight: 0.4,
                hard_ceiling: 0.97,
            },
        );
        signals.insert(
            "sentiment".to_string(),
            SignalSettings {
                weight: 0.2,
                hard_ceiling: 0.97,
            },
        );
        signals.insert(
            "outlier".to_string(),
            SignalSettings {
                weight: 0.2,
                hard_ceiling: 0.95,
            },
        );
        Self {
            flag_threshold: 0.75,
            signal_timeout_seconds: 20,
            signals,
        }
    }
}

impl EnsembleConfig {
    pub fn settings_for(&self, signal: &str) -> Option<SignalSettings> {
        self.signals.get(signal).copied()
    }
}

/// Underwriting score bands and pricing inputs. These are business policy,
/// supplied to the decision engine rather than compiled into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub auto_approve_threshold: f64,
    pub auto_reject_threshold: f64,
    pub review_min: f64,
    pub review_max: f64,
    pub default_coverage: f64,
    /// Annual base rate per $100k of coverage, keyed by policy type
    pub base_rates: BTreeMap<String, f64>,
    pub fallback_base_rate: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut base_rates = BTreeMap::new();
        base_rates.insert("life".to_string(), 500.0);
        base_rates.insert("health".to_string(), 3000.0);
        base_rates.insert("auto".to_string(), 1200.0);
        base_rates.insert("home".to_string(), 800.0);
        Self {
            auto_approve_threshold: 30.0,
            auto_reject_threshold: 85.0,
            review_min: 70.0,
            review_max: 85.0,
            default_coverage: 100_000.0,
            base_rates,
            fallback_base_rate: 1000.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid retry count: {0} (must be between 1 and 10)")]
    InvalidRetries(u32),
    #[error("Invalid backoff range: base {0}ms exceeds cap {1}ms")]
    InvalidBackoff(u64, u64),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidDimension(u32),
    #[error("Invalid cache capacity: {0} (must be at least 1)")]
    InvalidCacheCapacity(usize),
    #[error("Invalid target chunk size: {0} (must be between 100 and 2048)")]
    InvalidTargetChunkSize(usize),
    #[error("Max chunk size ({0}) must be greater than target chunk size ({1})")]
    MaxChunkSizeTooSmall(usize, usize),
    #[error("Target chunk size ({0}) must be greater than min chunk size ({1})")]
    TargetChunkSizeTooSmall(usize, usize),
    #[error("Invalid overlap size: {0} (must be below min chunk size {1})")]
    InvalidOverlapSize(usize, usize),
    #[error("Invalid signal weight for '{0}': {1} (must be in (0, 1])")]
    InvalidSignalWeight(String, f64),
    #[error("Invalid hard ceiling for '{0}': {1} (must be in (0, 1])")]
    InvalidHardCeiling(String, f64),
    #[error("Invalid flag threshold: {0} (must be in (0, 1])")]
    InvalidFlagThreshold(f64),
    #[error("Invalid score band: approve {0} must be below reject {1}")]
    InvalidScoreBands(f64, f64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_base_dir()?)
    }

    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.base_dir.join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    pub fn default_base_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Could not determine local data directory for this platform")?;
        Ok(data_dir.join("claimlens"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.inference.validate()?;
        self.validate_chunking()?;

        if self.cache.capacity == 0 {
            return Err(ConfigError::InvalidCacheCapacity(self.cache.capacity));
        }

        if !(64..=4096).contains(&self.index.dimension) {
            return Err(ConfigError::InvalidDimension(self.index.dimension));
        }

        self.validate_ensemble()?;

        if self.policy.auto_approve_threshold >= self.policy.auto_reject_threshold {
            return Err(ConfigError::InvalidScoreBands(
                self.policy.auto_approve_threshold,
                self.policy.auto_reject_threshold,
            ));
        }

        Ok(())
    }

    fn validate_chunking(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(100..=2048).contains(&config.target_chunk_tokens) {
            return Err(ConfigError::InvalidTargetChunkSize(
                config.target_chunk_tokens,
            ));
        }

        if config.max_chunk_tokens <= config.target_chunk_tokens {
            return Err(ConfigError::MaxChunkSizeTooSmall(
                config.max_chunk_tokens,
                config.target_chunk_tokens,
            ));
        }

        if config.target_chunk_tokens <= config.min_chunk_tokens {
            return Err(ConfigError::TargetChunkSizeTooSmall(
                config.target_chunk_tokens,
                config.min_chunk_tokens,
            ));
        }

        if config.overlap_tokens >= config.min_chunk_tokens {
            return Err(ConfigError::InvalidOverlapSize(
                config.overlap_tokens,
                config.min_chunk_tokens,
            ));
        }

        Ok(())
    }

    fn validate_ensemble(&self) -> Result<(), ConfigError> {
        let config = &self.ensemble;

        if !(0.0..=1.0).contains(&config.flag_threshold) || config.flag_threshold == 0.0 {
            return Err(ConfigError::InvalidFlagThreshold(config.flag_threshold));
        }

        for (name, settings) in &config.signals {
            if !(0.0..=1.0).contains(&settings.weight) || settings.weight == 0.0 {
                return Err(ConfigError::InvalidSignalWeight(
                    name.clone(),
                    settings.weight,
                ));
            }
            if !(0.0..=1.0).contains(&settings.hard_ceiling) || settings.hard_ceiling == 0.0 {
                return Err(ConfigError::InvalidHardCeiling(
                    name.clone(),
                    settings.hard_ceiling,
                ));
            }
        }

        Ok(())
    }

    /// Path of the SQLite metadata store
    pub fn metadata_db_path(&self) -> PathBuf {
        self.base_dir.join("metadata.db")
    }

    /// Directory holding the approximate vector index dataset
    pub fn ann_index_path(&self) -> PathBuf {
        self.base_dir.join("vectors")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            chunking: ChunkingConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            ensemble: EnsembleConfig::default(),
            policy: PolicyConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))?;

        for model in [
            &self.embed_model,
            &self.classify_model,
            &self.sentiment_model,
            &self.generate_model,
        ] {
            if model.trim().is_empty() {
                return Err(ConfigError::InvalidModel(model.clone()));
            }
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if self.max_retries == 0 || self.max_retries > 10 {
            return Err(ConfigError::InvalidRetries(self.max_retries));
        }

        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                self.base_backoff_ms,
                self.max_backoff_ms,
            ));
        }

        Ok(())
    }

    pub fn gateway_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}
