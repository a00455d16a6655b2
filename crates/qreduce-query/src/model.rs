//! The structured form of one query.
//!
//! A [`QueryModel`] is a flat arena. Scopes, relations, conditions and
//! opaque calls refer to each other by index (`ScopeId`, `RelationId`, ...),
//! never by pointer, so the model can be cloned and inspected freely.
//!
//! Scope ids are allocated in lowering order: a scope's children (derived
//! tables and subqueries) always have larger ids than the scope itself.

use std::collections::BTreeSet;
use std::fmt;

use sqlparser::ast::{Expr, Statement};

use crate::opaque::{OpaqueKind, OpaqueRegistry};

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(ScopeId, "s");
arena_id!(RelationId, "r");
arena_id!(ConditionId, "c");
arena_id!(OpaqueCallId, "o");

// ============================================================================
// Columns
// ============================================================================

/// A column of one relation occurrence. `column` is lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    pub relation: RelationId,
    pub column: String,
}

/// Anything a column reference can resolve to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnKey {
    Relation(ColumnRef),
    /// A SELECT output alias referenced from WHERE/HAVING/ORDER BY/GROUP BY.
    Output { scope: ScopeId, name: String },
}

impl ColumnKey {
    pub fn relation(&self) -> Option<RelationId> {
        match self {
            ColumnKey::Relation(column) => Some(column.relation),
            ColumnKey::Output { .. } => None,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, ColumnKey::Output { .. })
    }
}

// ============================================================================
// Scopes & relations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    /// `FROM (SELECT ...) AS alias`
    Derived,
    /// `IN (SELECT ...)`, `EXISTS (SELECT ...)` or a scalar subquery.
    Subquery,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub relations: Vec<RelationId>,
    pub conditions: Vec<ConditionId>,
    pub outputs: Vec<OutputColumn>,
    pub group_by: Vec<GroupKey>,
    pub opaque_calls: Vec<OpaqueCallId>,
    pub distinct: bool,
    pub ordered: bool,
    pub limited: bool,
    /// Some ORDER BY key calls an opaque function or reads an opaque output.
    pub opaque_order: bool,
    /// This scope's query with opaque calls stubbed.
    pub stubbed_sql: String,
}

impl Scope {
    pub(crate) fn new(id: ScopeId, kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            id,
            kind,
            parent,
            relations: Vec::new(),
            conditions: Vec::new(),
            outputs: Vec::new(),
            group_by: Vec::new(),
            opaque_calls: Vec::new(),
            distinct: false,
            ordered: false,
            limited: false,
            opaque_order: false,
            stubbed_sql: String::new(),
        }
    }

    pub fn output(&self, name: &str) -> Option<&OutputColumn> {
        self.outputs.iter().find(|o| o.name.eq_ignore_ascii_case(name))
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSource {
    Base { table: String },
    Derived { scope: ScopeId },
}

/// One occurrence of a relation in a FROM clause.
#[derive(Debug, Clone)]
pub struct Relation {
    pub id: RelationId,
    pub scope: ScopeId,
    /// Alias as written, or the table name when no alias was given.
    pub alias: String,
    pub source: RelationSource,
    pub columns: Vec<String>,
    /// Right-hand side of a LEFT JOIN.
    pub nullable: bool,
}

impl Relation {
    pub fn base_table(&self) -> Option<&str> {
        match &self.source {
            RelationSource::Base { table } => Some(table),
            RelationSource::Derived { .. } => None,
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Clone)]
pub struct OutputColumn {
    /// Lower-cased output name.
    pub name: String,
    pub display: String,
    pub sql: String,
    pub sources: BTreeSet<ColumnKey>,
    pub aggregate: bool,
    pub opaque_calls: Vec<OpaqueCallId>,
    /// Computed, directly or through derived columns, from an opaque call.
    pub opaque_lineage: bool,
    /// Set when the output is a bare column reference.
    pub column: Option<ColumnRef>,
}

#[derive(Debug, Clone)]
pub struct GroupKey {
    /// Expression text, with positional and alias references expanded.
    pub sql: String,
    pub columns: BTreeSet<ColumnKey>,
    /// Set when the key is a bare column reference.
    pub column: Option<ColumnRef>,
    pub opaque_lineage: bool,
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOrigin {
    Where,
    On {
        join: JoinKind,
        /// The nullable relation of a LEFT JOIN.
        nullable: Option<RelationId>,
    },
    Having,
}

impl ConditionOrigin {
    pub fn site(self) -> OpaqueSite {
        match self {
            ConditionOrigin::Where => OpaqueSite::Where,
            ConditionOrigin::On { .. } => OpaqueSite::JoinOn,
            ConditionOrigin::Having => OpaqueSite::Having,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Comparison,
    InList,
    InSubquery,
    Exists,
    Like,
    Between,
    NullTest,
    Disjunction,
    Negation,
    OpaqueCall,
    Other,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionKind::Comparison => "comparison",
            ConditionKind::InList => "in-list",
            ConditionKind::InSubquery => "in-subquery",
            ConditionKind::Exists => "exists",
            ConditionKind::Like => "like",
            ConditionKind::Between => "between",
            ConditionKind::NullTest => "null-test",
            ConditionKind::Disjunction => "disjunction",
            ConditionKind::Negation => "negation",
            ConditionKind::OpaqueCall => "opaque-call",
            ConditionKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// One conjunct of a WHERE, ON or HAVING clause.
#[derive(Debug, Clone)]
pub struct Condition {
    pub id: ConditionId,
    pub scope: ScopeId,
    pub expr: Expr,
    pub sql: String,
    pub origin: ConditionOrigin,
    pub kind: ConditionKind,
    pub columns: BTreeSet<ColumnKey>,
    pub relations: BTreeSet<RelationId>,
    pub subqueries: Vec<ScopeId>,
    pub has_aggregate: bool,
    /// Relations whose all-NULL row makes this condition not true.
    pub null_rejecting: BTreeSet<RelationId>,
    /// Contains an opaque call or reads an opaque output.
    pub opaque_dependent: bool,
    pub opaque_calls: Vec<OpaqueCallId>,
}

impl Condition {
    pub fn rejects_nulls_of(&self, relation: RelationId) -> bool {
        self.null_rejecting.contains(&relation)
    }

    pub fn references_outputs(&self) -> bool {
        self.columns.iter().any(ColumnKey::is_output)
    }
}

// ============================================================================
// Opaque calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaqueSite {
    Where,
    JoinOn,
    Select,
    GroupBy,
    Having,
    OrderBy,
}

impl fmt::Display for OpaqueSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpaqueSite::Where => "WHERE",
            OpaqueSite::JoinOn => "JOIN ON",
            OpaqueSite::Select => "SELECT",
            OpaqueSite::GroupBy => "GROUP BY",
            OpaqueSite::Having => "HAVING",
            OpaqueSite::OrderBy => "ORDER BY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct OpaqueCall {
    pub id: OpaqueCallId,
    pub kind: OpaqueKind,
    pub function: String,
    pub scope: ScopeId,
    pub site: OpaqueSite,
    /// String-literal arguments (model name, prompt, ...).
    pub config: Vec<String>,
    /// Columns fed to the call.
    pub context: BTreeSet<ColumnKey>,
    pub output: Option<String>,
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueryModel {
    pub text: String,
    /// The statement as parsed.
    pub statement: Statement,
    /// Opaque-dependent conjuncts replaced by `TRUE`, opaque calls stubbed.
    pub stubbed: Statement,
    pub scopes: Vec<Scope>,
    pub relations: Vec<Relation>,
    pub conditions: Vec<Condition>,
    pub opaque_calls: Vec<OpaqueCall>,
    pub registry: OpaqueRegistry,
}

impl QueryModel {
    pub fn root(&self) -> &Scope {
        &self.scopes[0]
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn relation(&self, id: RelationId) -> &Relation {
        &self.relations[id.0]
    }

    pub fn condition(&self, id: ConditionId) -> &Condition {
        &self.conditions[id.0]
    }

    pub fn opaque_call(&self, id: OpaqueCallId) -> &OpaqueCall {
        &self.opaque_calls[id.0]
    }

    /// Distinct base tables referenced anywhere, by catalog name.
    pub fn base_tables(&self) -> BTreeSet<String> {
        self.relations
            .iter()
            .filter_map(|r| r.base_table().map(str::to_string))
            .collect()
    }

    /// Occurrences of `table` across all scopes.
    pub fn occurrences<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Relation> + 'a {
        self.relations
            .iter()
            .filter(move |r| r.base_table().is_some_and(|t| t.eq_ignore_ascii_case(table)))
    }

    /// Nesting depth of a scope; the root is 0.
    pub fn depth(&self, mut scope: ScopeId) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.scope(scope).parent {
            scope = parent;
            depth += 1;
        }
        depth
    }

    /// The opaque call closest to the root (first in query order on ties).
    pub fn outermost_opaque_call(&self) -> Option<&OpaqueCall> {
        self.opaque_calls
            .iter()
            .min_by_key(|call| (self.depth(call.scope), call.id))
    }

    /// Scopes that are `scope` or nested inside it.
    pub fn scope_and_descendants(&self, scope: ScopeId) -> Vec<ScopeId> {
        self.scopes
            .iter()
            .filter(|s| {
                let mut cur = Some(s.id);
                while let Some(id) = cur {
                    if id == scope {
                        return true;
                    }
                    cur = self.scope(id).parent;
                }
                false
            })
            .map(|s| s.id)
            .collect()
    }

    /// Human-readable name of a column key, e.g. `d.country`.
    pub fn column_name(&self, key: &ColumnKey) -> String {
        match key {
            ColumnKey::Relation(column) => {
                format!("{}.{}", self.relation(column.relation).alias, column.column)
            }
            ColumnKey::Output { name, .. } => name.clone(),
        }
    }
}
