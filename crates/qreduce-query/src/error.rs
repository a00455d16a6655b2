//! Errors raised while building a query model.

/// The query text is not SQL, or uses a construct the analyzer does not model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("failed to parse SQL: {0}")]
    Syntax(String),

    #[error("expected exactly one SQL statement, got {0}")]
    StatementCount(usize),

    #[error("unsupported SQL statement: only SELECT queries are analyzed")]
    NotAQuery,

    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

impl ParseError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }
}

/// A name in the query does not resolve to exactly one thing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("unknown relation `{0}`")]
    UnknownRelation(String),

    #[error("unknown column `{0}`")]
    UnknownColumn(String),

    #[error("ambiguous column `{column}` (candidates: {candidates})")]
    AmbiguousColumn { column: String, candidates: String },

    #[error("duplicate relation alias `{0}`")]
    DuplicateAlias(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}
