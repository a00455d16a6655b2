//! Query model, predicate classification and stub rendering for qreduce.
//!
//! ```text
//! query text ──► QueryModelBuilder ──► QueryModel ──► classify ──► Classification
//!                   (catalog,               │
//!                    opaque registry)       └──► render: stubbed / rebound SQL
//! ```
//!
//! The model is the only thing later stages look at: the planner reads
//! relations, conditions and grouping keys from it, and the harness renders
//! the stubbed statement it carries.

pub mod builder;
pub mod catalog;
pub mod classify;
pub mod error;
pub mod model;
pub mod opaque;
pub mod render;

pub use builder::QueryModelBuilder;
pub use catalog::{Catalog, CatalogEntry};
pub use classify::{classify, is_monotone_bound, Classification, OpaqueReason};
pub use error::{ModelError, ParseError, ResolutionError};
pub use model::{
    ColumnKey, ColumnRef, Condition, ConditionId, ConditionKind, ConditionOrigin, GroupKey,
    JoinKind, OpaqueCall, OpaqueCallId, OpaqueSite, OutputColumn, QueryModel, Relation,
    RelationId, RelationSource, Scope, ScopeId, ScopeKind,
};
pub use opaque::{OpaqueKind, OpaqueRegistry};
pub use render::{rebind, rebound_sql, stubbed_sql};

/// Parse and lower `text` in one call.
pub fn build_model(
    text: &str,
    catalog: &Catalog,
    registry: &OpaqueRegistry,
) -> Result<QueryModel, ModelError> {
    QueryModelBuilder::new(catalog, registry).build(text)
}
