//! Engine errors.

use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("relation `{0}` not found")]
    UnknownRelation(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("engine error: {message}")]
    Execution { message: String, transient: bool },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether retrying the same call may succeed (busy or locked database).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Execution { transient: true, .. })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        let transient = matches!(
            err.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        );
        Self::Execution {
            message: err.to_string(),
            transient,
        }
    }
}
