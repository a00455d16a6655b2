//! Errors of the analysis pipeline.

use std::path::PathBuf;

use qreduce_engine::EngineError;
use qreduce_query::ModelError;

/// Why one query could not be analyzed. Fatal for that query only.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AnalysisError {
    /// Short category used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Read { .. } => "io",
            AnalysisError::Model(ModelError::Parse(_)) => "parse",
            AnalysisError::Model(ModelError::Resolution(_)) => "resolution",
            AnalysisError::Engine(_) => "engine",
        }
    }
}

/// The reduced query did not return the baseline result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "query `{query}` diverged: {missing} baseline tuple(s) missing, {unexpected} unexpected tuple(s)"
)]
pub struct DivergenceError {
    pub query: String,
    pub missing: usize,
    pub unexpected: usize,
}

/// The configuration file is unreadable or invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
