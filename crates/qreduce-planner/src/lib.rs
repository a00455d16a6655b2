//! Reduction planning for qreduce.
//!
//! Motivation
//! ----------
//! An opaque operator is expensive per row. Before it runs, the cheap part
//! of the query already tells us which rows can possibly reach it: a row of
//! `edges` that has no destination in Canada cannot appear in a query whose
//! WHERE clause demands one. This crate turns the cheap conditions of a
//! classified [`QueryModel`](qreduce_query::QueryModel) into candidate row
//! sets, one per relation occurrence:
//!
//! ```text
//! plan():   classified model ──► ReductionPlan   (symbolic, no engine calls)
//! solve():  ReductionPlan    ──► CandidateSets   (snapshots in the host engine)
//! ```
//!
//! Every intermediate candidate set is a superset of the rows the
//! opaque-free query uses, so stopping early (round limit) is always safe.

pub mod candidates;
pub mod plan;
pub mod solve;

pub use candidates::{CandidateSets, RelationCandidates};
pub use plan::{
    plan, GroupPrepass, ReductionPlan, RelationPlan, ScopePlan, SemiJoinEdge, UnreducedReason,
};
pub use solve::solve;

/// Knobs of the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Upper bound on semi-join rounds per scope.
    pub max_rounds: usize,
    /// Restrict grouping-key owners through monotone HAVING bounds.
    pub group_prepass: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 64,
            group_prepass: true,
        }
    }
}
