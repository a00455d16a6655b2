//! Reduction statistics.

use std::collections::BTreeSet;

use qreduce_planner::CandidateSets;
use qreduce_query::{ColumnKey, OpaqueKind, QueryModel, RelationId};
use serde::Serialize;

use crate::harness::ReducedTable;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationReduction {
    pub relation: String,
    pub original: u64,
    pub reduced: u64,
    pub ratio: f64,
}

impl RelationReduction {
    pub fn new(relation: impl Into<String>, original: u64, reduced: u64) -> Self {
        Self {
            relation: relation.into(),
            original,
            reduced,
            ratio: reduction_ratio(original, reduced),
        }
    }

    pub fn rows_avoided(&self) -> u64 {
        self.original.saturating_sub(self.reduced)
    }
}

impl From<&ReducedTable> for RelationReduction {
    fn from(table: &ReducedTable) -> Self {
        Self::new(&table.table, table.original, table.reduced)
    }
}

/// `1 - reduced / original`, or 0 for an empty relation.
pub fn reduction_ratio(original: u64, reduced: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        1.0 - reduced as f64 / original as f64
    }
}

/// Rows kept away from the outermost opaque call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpaqueSavings {
    pub function: String,
    pub kind: OpaqueKind,
    pub site: String,
    /// Aliases of the relation occurrences feeding the call.
    pub relations: Vec<String>,
    pub rows_before: u64,
    pub rows_after: u64,
}

impl OpaqueSavings {
    pub fn rows_avoided(&self) -> u64 {
        self.rows_before.saturating_sub(self.rows_after)
    }
}

/// Savings at the outermost opaque call, measured over the occurrences its
/// context columns come from (every occurrence of its scope when the call
/// reads no column).
pub fn opaque_savings(model: &QueryModel, candidates: &CandidateSets) -> Option<OpaqueSavings> {
    let call = model.outermost_opaque_call()?;
    let mut feeding: BTreeSet<RelationId> = BTreeSet::new();
    for key in &call.context {
        collect_relations(model, key, &mut feeding);
    }
    if feeding.is_empty() {
        feeding.extend(model.scope(call.scope).relations.iter().copied());
    }

    let (mut before, mut after) = (0, 0);
    let mut relations = Vec::new();
    for id in feeding {
        if let Some(c) = candidates.get(id) {
            before += c.original_rows;
            after += c.rows;
            relations.push(c.alias.clone());
        }
    }
    Some(OpaqueSavings {
        function: call.function.clone(),
        kind: call.kind,
        site: call.site.to_string(),
        relations,
        rows_before: before,
        rows_after: after,
    })
}

fn collect_relations(model: &QueryModel, key: &ColumnKey, out: &mut BTreeSet<RelationId>) {
    match key {
        ColumnKey::Relation(column) => {
            out.insert(column.relation);
        }
        ColumnKey::Output { scope, name } => {
            if let Some(output) = model.scope(*scope).output(name) {
                for source in &output.sources {
                    if !source.is_output() {
                        collect_relations(model, source, out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_empty_relation_is_zero() {
        assert_eq!(reduction_ratio(0, 0), 0.0);
        assert_eq!(reduction_ratio(8, 8), 0.0);
        assert_eq!(reduction_ratio(8, 2), 0.75);
        assert_eq!(RelationReduction::new("nodes", 8, 6).rows_avoided(), 2);
    }
}
