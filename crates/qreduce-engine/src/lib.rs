//! Host engine capabilities for qreduce.
//!
//! The analyzer never touches rows itself. Everything it needs from a
//! database is expressed through [`HostEngine`]:
//!
//! - `execute(sql, bindings)` runs a read query and returns its rows;
//! - `materialize(source, predicate)` creates a new, independently owned
//!   snapshot of the rows of `source` that satisfy `predicate`, keeping each
//!   row's engine row id;
//! - `reset(relation)` releases a snapshot created by `materialize`.
//!
//! The catalog helpers (`relations`, `columns`, `cardinality`) let callers
//! resolve names and report sizes without knowing the engine.
//!
//! [`SqliteEngine`] is the concrete adapter. [`Scratch`] is the scoped guard
//! that owns every snapshot created while analyzing one query and releases
//! them on every exit path.

pub mod dataset;
pub mod error;
pub mod retry;
pub mod scratch;
pub mod sqlite;
pub mod value;

pub use error::EngineError;
pub use retry::RetryPolicy;
pub use scratch::Scratch;
pub use sqlite::SqliteEngine;
pub use value::{RowSet, Value};

// ============================================================================
// Capabilities
// ============================================================================

/// Where the rows of a new snapshot come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source<'a> {
    /// An existing relation: a base table or an earlier snapshot.
    /// Row ids are preserved.
    Relation(&'a str),
    /// The result of a read query (derived tables). Row ids are fresh.
    Query(&'a str),
}

/// A boolean filter over one relation, written against `alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub alias: String,
    /// `None` keeps every row.
    pub sql: Option<String>,
}

impl Predicate {
    /// Keep all rows of the source.
    pub fn all(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            sql: None,
        }
    }

    pub fn new(alias: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            sql: Some(sql.into()),
        }
    }

    /// Conjunction of `parts`; an empty iterator keeps all rows.
    pub fn conjunction<I, S>(alias: impl Into<String>, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = parts
            .into_iter()
            .map(|part| format!("({})", part.as_ref()))
            .collect();
        if parts.is_empty() {
            Self::all(alias)
        } else {
            Self::new(alias, parts.join(" AND "))
        }
    }
}

/// The three host capabilities plus catalog helpers.
pub trait HostEngine {
    /// Run a read query. `bindings` fill positional `?` parameters.
    fn execute(&mut self, sql: &str, bindings: &[Value]) -> Result<RowSet, EngineError>;

    /// Create a new snapshot and return its relation name.
    fn materialize(&mut self, source: Source<'_>, predicate: &Predicate)
        -> Result<String, EngineError>;

    /// Release a snapshot created by [`HostEngine::materialize`].
    /// Base relations are never touched; resetting one is a no-op.
    fn reset(&mut self, relation: &str) -> Result<(), EngineError>;

    /// Base relations visible to queries, sorted by name.
    fn relations(&mut self) -> Result<Vec<String>, EngineError>;

    /// Ordered column names of a base relation or snapshot.
    fn columns(&mut self, relation: &str) -> Result<Vec<String>, EngineError>;

    /// Number of rows in a base relation or snapshot.
    fn cardinality(&mut self, relation: &str) -> Result<u64, EngineError> {
        let rows = self.execute(
            &format!("SELECT count(*) FROM {}", quote_ident(relation)),
            &[],
        )?;
        match rows.rows.first().and_then(|row| row.first()) {
            Some(Value::Integer(n)) => Ok(u64::try_from(*n).unwrap_or(0)),
            other => Err(EngineError::execution(format!(
                "unexpected count result for `{relation}`: {other:?}"
            ))),
        }
    }
}

/// Quote an identifier for SQL, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
