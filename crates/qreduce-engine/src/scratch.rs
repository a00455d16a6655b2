//! Scoped ownership of materialized snapshots.
//!
//! Every snapshot created while analyzing one query goes through a
//! [`Scratch`]. Dropping the guard resets all snapshots it still owns, so
//! an early return or a `?` never leaks relations into the next query.

use tracing::{debug, warn};

use crate::{EngineError, HostEngine, Predicate, RetryPolicy, RowSet, Source, Value};

pub struct Scratch<'e, E: HostEngine + ?Sized> {
    engine: &'e mut E,
    retry: RetryPolicy,
    owned: Vec<String>,
}

impl<'e, E: HostEngine + ?Sized> Scratch<'e, E> {
    pub fn new(engine: &'e mut E, retry: RetryPolicy) -> Self {
        Self {
            engine,
            retry,
            owned: Vec::new(),
        }
    }

    pub fn execute(&mut self, sql: &str, bindings: &[Value]) -> Result<RowSet, EngineError> {
        let engine = &mut *self.engine;
        self.retry.run("execute", || engine.execute(sql, bindings))
    }

    /// Materialize a snapshot owned by this guard.
    pub fn materialize(
        &mut self,
        source: Source<'_>,
        predicate: &Predicate,
    ) -> Result<String, EngineError> {
        let engine = &mut *self.engine;
        let name = self
            .retry
            .run("materialize", || engine.materialize(source, predicate))?;
        self.owned.push(name.clone());
        Ok(name)
    }

    pub fn cardinality(&mut self, relation: &str) -> Result<u64, EngineError> {
        let engine = &mut *self.engine;
        self.retry.run("cardinality", || engine.cardinality(relation))
    }

    /// Release one snapshot early. Names this guard does not own are ignored.
    pub fn release(&mut self, relation: &str) -> Result<(), EngineError> {
        let Some(pos) = self.owned.iter().position(|name| name == relation) else {
            return Ok(());
        };
        self.owned.remove(pos);
        self.engine.reset(relation)
    }

    pub fn owns(&self, relation: &str) -> bool {
        self.owned.iter().any(|name| name == relation)
    }

    pub fn owned(&self) -> &[String] {
        &self.owned
    }
}

impl<E: HostEngine + ?Sized> Drop for Scratch<'_, E> {
    fn drop(&mut self) {
        if !self.owned.is_empty() {
            debug!(count = self.owned.len(), "releasing scratch relations");
        }
        while let Some(name) = self.owned.pop() {
            if let Err(err) = self.engine.reset(&name) {
                warn!(relation = %name, error = %err, "failed to release scratch relation");
            }
        }
    }
}
