//! Execution harness: reduced copies of the base tables and the two runs of
//! the stubbed query.
//!
//! Source tables are never written. Each base table gets its own reduced
//! snapshot (a full copy when nothing reduces it), so the reduced run never
//! shares rows with the baseline run.

use std::collections::BTreeMap;

use qreduce_engine::{EngineError, HostEngine, RowSet, Scratch, Source};
use qreduce_planner::CandidateSets;
use qreduce_query::{rebound_sql, stubbed_sql, QueryModel};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedTable {
    pub table: String,
    pub snapshot: String,
    pub original: u64,
    pub reduced: u64,
}

/// Reduced snapshots keyed by lower-cased table name.
pub type ReducedTables = BTreeMap<String, ReducedTable>;

pub fn materialize_reduced<E: HostEngine + ?Sized>(
    scratch: &mut Scratch<'_, E>,
    candidates: &CandidateSets,
) -> Result<ReducedTables, EngineError> {
    let mut out = ReducedTables::new();
    for (table, predicate) in candidates.table_predicates() {
        let original = scratch.cardinality(&table)?;
        let snapshot = scratch.materialize(Source::Relation(&table), &predicate)?;
        let reduced = scratch.cardinality(&snapshot)?;
        debug!(%table, %snapshot, original, reduced, "reduced table");
        out.insert(
            table.to_ascii_lowercase(),
            ReducedTable {
                table,
                snapshot,
                original,
                reduced,
            },
        );
    }
    Ok(out)
}

/// SQL of the stubbed query pointed at the reduced snapshots.
pub fn reduced_sql(model: &QueryModel, reduced: &ReducedTables) -> String {
    let bindings: BTreeMap<String, String> = reduced
        .iter()
        .map(|(table, r)| (table.clone(), r.snapshot.clone()))
        .collect();
    rebound_sql(model, &bindings)
}

pub fn baseline_rows<E: HostEngine + ?Sized>(
    scratch: &mut Scratch<'_, E>,
    model: &QueryModel,
) -> Result<RowSet, EngineError> {
    scratch.execute(&stubbed_sql(model), &[])
}

pub fn reduced_rows<E: HostEngine + ?Sized>(
    scratch: &mut Scratch<'_, E>,
    model: &QueryModel,
    reduced: &ReducedTables,
) -> Result<RowSet, EngineError> {
    scratch.execute(&reduced_sql(model, reduced), &[])
}
