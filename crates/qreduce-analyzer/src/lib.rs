//! End-to-end query reduction analysis.
//!
//! Motivation
//! ----------
//! A candidate set is only worth reporting if running the query over it
//! gives the same answer. This crate drives one query (or a batch) through
//! the whole pipeline and checks exactly that:
//!
//! ```text
//!   SQL text
//!     │ qreduce_query::build_model + classify
//!     ▼
//!   QueryModel + Classification
//!     │ qreduce_planner::plan + solve
//!     ▼
//!   CandidateSets ──► reduced table snapshots (harness)
//!     │
//!     ├── baseline: stubbed query over the source tables
//!     └── reduced:  stubbed query over the snapshots
//!             │ verify::compare (multiset)
//!             ▼
//!       ReductionResult { relations, opaque_savings, verdict, .. }
//! ```
//!
//! Every snapshot created for a query is dropped before the next query
//! starts, on success and on failure.

pub mod analyzer;
pub mod batch;
pub mod config;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod result;
pub mod verify;

pub use analyzer::Analyzer;
pub use batch::{run_batch, BatchItem, BatchReport, BatchSummary};
pub use config::AnalyzerConfig;
pub use error::{AnalysisError, ConfigError, DivergenceError};
pub use harness::{ReducedTable, ReducedTables};
pub use metrics::{opaque_savings, reduction_ratio, OpaqueSavings, RelationReduction};
pub use result::{OpaqueCondition, ReductionResult, SolveStats, Timing, UnreducedRelation};
pub use verify::{compare, Divergence, TupleCount, Verdict};
