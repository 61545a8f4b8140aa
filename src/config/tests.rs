use super::*;
use tempfile::TempDir;

#[test]
fn default_config_is_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
}

#[test]
fn load_missing_file_returns_defaults() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config::load(dir.path()).expect("Failed to load config");
    assert_eq!(config.inference, InferenceConfig::default());
    assert_eq!(config.base_dir, dir.path());
}

#[test]
fn save_and_reload_round_trip() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = Config::load(dir.path()).expect("Failed to load config");
    config.inference.host = "inference.internal".to_string();
    config.inference.port = 9000;
    config.index.dimension = 1024;
    config.save().expect("Failed to save config");

    let reloaded = Config::load(dir.path()).expect("Failed to reload config");
    assert_eq!(reloaded.inference.host, "inference.internal");
    assert_eq!(reloaded.inference.port, 9000);
    assert_eq!(reloaded.index.dimension, 1024);
}

#[test]
fn invalid_protocol_rejected() {
    let mut config = Config::default();
    config.inference.protocol = "ftp".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidProtocol(_))
    ));
}

#[test]
fn zero_retries_rejected() {
    let mut config = Config::default();
    config.inference.max_retries = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidRetries(0))
    ));
}

#[test]
fn backoff_base_above_cap_rejected() {
    let mut config = Config::default();
    config.inference.base_backoff_ms = 20_000;
    config.inference.max_backoff_ms = 10_000;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidBackoff(20_000, 10_000))
    ));
}

#[test]
fn dimension_bounds_enforced() {
    let mut config = Config::default();
    config.index.dimension = 32;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidDimension(32))
    ));
}

#[test]
fn chunk_size_relationships_enforced() {
    let mut config = Config::default();
    config.chunking.max_chunk_tokens = config.chunking.target_chunk_tokens;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::MaxChunkSizeTooSmall(_, _))
    ));
}

#[test]
fn signal_weight_bounds_enforced() {
    let mut config = Config::default();
    config.ensemble.signals.insert(
        "pattern".to_string(),
        SignalSettings {
            weight: 1.5,
            hard_ceiling: 0.6,
        },
    );
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidSignalWeight(_, _))
    ));
}

#[test]
fn score_bands_must_be_ordered() {
    let mut config = Config::default();
    config.policy.auto_approve_threshold = 90.0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidScoreBands(_, _))
    ));
}

#[test]
fn default_ensemble_carries_all_signals() {
    let ensemble = EnsembleConfig::default();
    for name in ["pattern", "classifier", "sentiment", "outlier"] {
        assert!(ensemble.settings_for(name).is_some(), "missing {}", name);
    }
    let total: f64 = ensemble.signals.values().map(|s| s.weight).sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[test]
fn paths_derive_from_base_dir() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config::load(dir.path()).expect("Failed to load config");
    assert_eq!(config.metadata_db_path(), dir.path().join("metadata.db"));
    assert_eq!(config.ann_index_path(), dir.path().join("vectors"));
}
