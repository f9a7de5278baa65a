use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the adaptation core.
///
/// Only `Configuration` is fatal to callers; every other kind is absorbed by
/// the component that owns it and degrades to the last-known-good state.
#[derive(Error, Debug)]
pub enum AdaptError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Variant {variant} failed to evaluate: {reason}")]
    VariantEvaluation { variant: String, reason: String },

    #[error("Malformed data: {0}")]
    Data(String),

    #[error("Persistence failure at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upgrade aborted: {0}")]
    Upgrade(String),
}

impl AdaptError {
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AdaptError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable tag used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AdaptError::Configuration(_) => "configuration",
            AdaptError::VariantEvaluation { .. } => "variant_evaluation",
            AdaptError::Data(_) => "data",
            AdaptError::Persistence { .. } => "persistence",
            AdaptError::Serialization(_) => "serialization",
            AdaptError::Upgrade(_) => "upgrade",
        }
    }
}

pub type Result<T> = std::result::Result<T, AdaptError>;
