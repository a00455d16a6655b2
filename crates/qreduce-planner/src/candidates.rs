//! Solved candidate sets.

use std::collections::BTreeMap;

use qreduce_engine::{quote_ident, Predicate};
use qreduce_query::RelationId;

/// Candidate rows of one relation occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationCandidates {
    pub relation: RelationId,
    pub alias: String,
    /// Catalog name for base relations; `None` for derived tables.
    pub table: Option<String>,
    /// Relation holding the full rows (the base table, or a snapshot of the
    /// derived table's stubbed query).
    pub original: String,
    pub original_rows: u64,
    /// Relation holding the current candidates; equal to `original` until
    /// something shrinks it.
    pub current: String,
    pub rows: u64,
}

impl RelationCandidates {
    pub fn is_reduced(&self) -> bool {
        self.current != self.original
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSets {
    pub relations: BTreeMap<RelationId, RelationCandidates>,
    /// Semi-join rounds run, summed over scopes.
    pub rounds: usize,
    /// Semi-joins evaluated, kept or not.
    pub semi_joins: usize,
    pub group_prepasses: usize,
}

impl CandidateSets {
    pub fn get(&self, relation: RelationId) -> Option<&RelationCandidates> {
        self.relations.get(&relation)
    }

    /// Occurrences of base table `table`, in relation order.
    pub fn occurrences<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a RelationCandidates> + 'a {
        self.relations
            .values()
            .filter(move |c| c.table.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(table)))
    }

    /// Rows of `table` to keep: the union of its occurrences' candidates.
    /// Any unreduced occurrence keeps the whole table.
    pub fn table_predicate(&self, table: &str) -> Predicate {
        let alias = quote_ident(table);
        let mut snapshots = Vec::new();
        for occurrence in self.occurrences(table) {
            if !occurrence.is_reduced() {
                return Predicate::all(alias);
            }
            snapshots.push(format!("SELECT rowid FROM {}", quote_ident(&occurrence.current)));
        }
        if snapshots.is_empty() {
            return Predicate::all(alias);
        }
        let sql = format!("{alias}.rowid IN ({})", snapshots.join(" UNION "));
        Predicate::new(alias, sql)
    }

    /// `table_predicate` for every base table with an occurrence.
    pub fn table_predicates(&self) -> BTreeMap<String, Predicate> {
        let mut out = BTreeMap::new();
        for table in self.relations.values().filter_map(|c| c.table.as_deref()) {
            if !out.contains_key(table) {
                out.insert(table.to_string(), self.table_predicate(table));
            }
        }
        out
    }
}
