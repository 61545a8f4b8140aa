use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("Vector index error: {0}")]
    Index(String),

    #[error("Index inconsistency: {0}")]
    IndexInconsistency(String),

    #[error("Inference error: {0}")]
    Inference(#[from] crate::inference::InferenceError),

    #[error("Decision failed: {0}")]
    DecisionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod cache;
pub mod chunking;
pub mod commands;
pub mod config;
pub mod engine;
pub mod ensemble;
pub mod indexer;
pub mod inference;
pub mod store;
pub mod telemetry;
