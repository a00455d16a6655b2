//! The outcome of analyzing one query.

use serde::Serialize;

use crate::error::DivergenceError;
use crate::metrics::{OpaqueSavings, RelationReduction};
use crate::verify::Verdict;

/// A condition the planner could not use because of an opaque operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpaqueCondition {
    pub sql: String,
    pub reason: String,
}

/// A relation occurrence nothing could shrink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreducedRelation {
    pub alias: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timing {
    pub model_ms: f64,
    pub solve_ms: f64,
    pub verify_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SolveStats {
    pub rounds: usize,
    pub semi_joins: usize,
    pub group_prepasses: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReductionResult {
    pub query: String,
    pub sql: String,
    pub stubbed_sql: String,
    pub reduced_sql: String,
    pub relations: Vec<RelationReduction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque_savings: Option<OpaqueSavings>,
    pub opaque_conditions: Vec<OpaqueCondition>,
    pub unreduced: Vec<UnreducedRelation>,
    pub baseline_rows: usize,
    pub reduced_rows: usize,
    pub stats: SolveStats,
    pub timing: Timing,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl ReductionResult {
    pub fn is_equivalent(&self) -> bool {
        self.verdict.is_equivalent()
    }

    pub fn relation(&self, name: &str) -> Option<&RelationReduction> {
        self.relations
            .iter()
            .find(|r| r.relation.eq_ignore_ascii_case(name))
    }

    /// Rows removed across all base relations. A diverged result claims
    /// nothing.
    pub fn rows_avoided(&self) -> u64 {
        if !self.is_equivalent() {
            return 0;
        }
        self.relations.iter().map(RelationReduction::rows_avoided).sum()
    }

    /// All base relations taken together.
    pub fn overall(&self) -> RelationReduction {
        let (original, reduced) = self
            .relations
            .iter()
            .fold((0, 0), |(o, r), rel| (o + rel.original, r + rel.reduced));
        RelationReduction::new("overall", original, reduced)
    }

    pub fn ensure_equivalent(&self) -> Result<(), DivergenceError> {
        match &self.verdict {
            Verdict::Equivalent => Ok(()),
            Verdict::Diverged(divergence) => Err(DivergenceError {
                query: self.query.clone(),
                missing: divergence.missing,
                unexpected: divergence.unexpected,
            }),
        }
    }
}
