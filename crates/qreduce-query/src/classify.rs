//! Predicate classification.
//!
//! Motivation
//! ----------
//! Only conditions that can be evaluated without an opaque call may shrink
//! the data. The builder already marks conjuncts that contain a call or read
//! an opaque output. This pass closes those marks over the query:
//!
//! - a column computed from a tainted column is tainted (SELECT outputs,
//!   derived-table columns);
//! - a condition touching a tainted column is opaque-dependent;
//! - a tainted grouping key taints every aggregate output and HAVING
//!   condition of its scope;
//! - an opaque WHERE/ON filter taints the aggregates of its scope, but HAVING
//!   conditions that are monotone bounds (or read only grouping keys) stay
//!   usable, since the filter can only remove rows from a group;
//! - a scope is narrowed when an opaque condition may drop its rows, and a
//!   scope reading a narrowed derived table counts as filtered itself;
//! - a LIMIT/OFFSET scope that is narrowed, or ordered by an opaque key,
//!   keeps rows the stubbed query cannot predict, so all its outputs are
//!   tainted.
//!
//! The sets are finite and only grow, so the loop terminates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value};

use crate::builder::function_name;
use crate::model::{
    ColumnKey, ColumnRef, ConditionId, ConditionOrigin, QueryModel, RelationSource, ScopeId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpaqueReason {
    /// The condition calls an opaque function.
    DirectCall,
    /// The condition reads an output computed by an opaque call.
    OutputReference,
    /// The condition reads a tainted column.
    TaintedColumn(String),
    /// A grouping key of the scope is tainted.
    TaintedGrouping,
    /// An opaque filter feeds the aggregate this condition bounds.
    FilteredAggregate,
}

impl fmt::Display for OpaqueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpaqueReason::DirectCall => write!(f, "calls an opaque function"),
            OpaqueReason::OutputReference => write!(f, "reads an opaque output"),
            OpaqueReason::TaintedColumn(column) => write!(f, "reads tainted column `{column}`"),
            OpaqueReason::TaintedGrouping => write!(f, "groups by a tainted key"),
            OpaqueReason::FilteredAggregate => {
                write!(f, "bounds an aggregate fed through an opaque filter")
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    cheap: BTreeSet<ConditionId>,
    opaque: BTreeMap<ConditionId, OpaqueReason>,
    tainted: BTreeSet<ColumnKey>,
    tainted_grouping: BTreeSet<ScopeId>,
    narrowed: BTreeSet<ScopeId>,
}

impl Classification {
    pub fn is_cheap(&self, id: ConditionId) -> bool {
        self.cheap.contains(&id)
    }

    pub fn cheap(&self) -> impl Iterator<Item = ConditionId> + '_ {
        self.cheap.iter().copied()
    }

    pub fn opaque(&self) -> impl Iterator<Item = (ConditionId, &OpaqueReason)> + '_ {
        self.opaque.iter().map(|(id, reason)| (*id, reason))
    }

    pub fn reason(&self, id: ConditionId) -> Option<&OpaqueReason> {
        self.opaque.get(&id)
    }

    pub fn is_tainted(&self, key: &ColumnKey) -> bool {
        self.tainted.contains(key)
    }

    pub fn has_tainted_grouping(&self, scope: ScopeId) -> bool {
        self.tainted_grouping.contains(&scope)
    }

    /// The real query may see fewer rows in `scope` than the stubbed one.
    pub fn is_narrowed(&self, scope: ScopeId) -> bool {
        self.narrowed.contains(&scope)
    }
}

pub fn classify(model: &QueryModel) -> Classification {
    let mut tainted: BTreeSet<ColumnKey> = BTreeSet::new();
    let mut opaque: BTreeMap<ConditionId, OpaqueReason> = BTreeMap::new();
    let mut tainted_grouping: BTreeSet<ScopeId> = BTreeSet::new();
    let mut narrowed: BTreeSet<ScopeId> = BTreeSet::new();

    // Lineage edges: target column <- source columns.
    let mut lineage: Vec<(ColumnKey, Vec<ColumnKey>)> = Vec::new();
    for scope in &model.scopes {
        for output in &scope.outputs {
            let target = ColumnKey::Output {
                scope: scope.id,
                name: output.name.clone(),
            };
            if !output.opaque_calls.is_empty() {
                tainted.insert(target.clone());
            }
            lineage.push((target, output.sources.iter().cloned().collect()));
        }
    }
    for relation in &model.relations {
        if let RelationSource::Derived { scope } = relation.source {
            for column in &relation.columns {
                let name = column.to_ascii_lowercase();
                lineage.push((
                    ColumnKey::Relation(ColumnRef {
                        relation: relation.id,
                        column: name.clone(),
                    }),
                    vec![ColumnKey::Output { scope, name }],
                ));
            }
        }
    }

    for condition in &model.conditions {
        if condition.opaque_dependent {
            let reason = if condition.opaque_calls.is_empty() {
                OpaqueReason::OutputReference
            } else {
                OpaqueReason::DirectCall
            };
            opaque.insert(condition.id, reason);
        }
    }

    loop {
        let mut changed = false;

        for (target, sources) in &lineage {
            if !tainted.contains(target) && sources.iter().any(|s| tainted.contains(s)) {
                tainted.insert(target.clone());
                changed = true;
            }
        }

        for scope in &model.scopes {
            let grouping_tainted = scope
                .group_by
                .iter()
                .any(|key| key.opaque_lineage || key.columns.iter().any(|c| tainted.contains(c)));
            let reads_narrowed = scope.relations.iter().any(|id| {
                matches!(
                    model.relation(*id).source,
                    RelationSource::Derived { scope: child } if narrowed.contains(&child)
                )
            });
            let filtered = reads_narrowed
                || scope.conditions.iter().any(|id| {
                    opaque.contains_key(id)
                        && !matches!(model.condition(*id).origin, ConditionOrigin::Having)
                });
            let narrows = filtered || scope.conditions.iter().any(|id| opaque.contains_key(id));
            if grouping_tainted && tainted_grouping.insert(scope.id) {
                changed = true;
            }
            let unpredictable_limit = scope.limited && (narrows || scope.opaque_order);
            if (narrows || unpredictable_limit) && narrowed.insert(scope.id) {
                changed = true;
            }
            if unpredictable_limit {
                for output in &scope.outputs {
                    let key = ColumnKey::Output {
                        scope: scope.id,
                        name: output.name.clone(),
                    };
                    if tainted.insert(key) {
                        changed = true;
                    }
                }
            }
            if grouping_tainted || filtered {
                for output in scope.outputs.iter().filter(|o| o.aggregate) {
                    let key = ColumnKey::Output {
                        scope: scope.id,
                        name: output.name.clone(),
                    };
                    if tainted.insert(key) {
                        changed = true;
                    }
                }
            }

            for id in &scope.conditions {
                if opaque.contains_key(id) {
                    continue;
                }
                let condition = model.condition(*id);
                let having = matches!(condition.origin, ConditionOrigin::Having);
                let tainted_column = condition.columns.iter().find(|c| tainted.contains(c));
                let reason = if let Some(column) = tainted_column {
                    Some(OpaqueReason::TaintedColumn(model.column_name(column)))
                } else if having && grouping_tainted {
                    Some(OpaqueReason::TaintedGrouping)
                } else if having
                    && filtered
                    && condition.has_aggregate
                    && !is_monotone_bound(&condition.expr)
                {
                    Some(OpaqueReason::FilteredAggregate)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    opaque.insert(*id, reason);
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }

    let cheap = model
        .conditions
        .iter()
        .map(|c| c.id)
        .filter(|id| !opaque.contains_key(id))
        .collect();
    Classification {
        cheap,
        opaque,
        tainted,
        tainted_grouping,
        narrowed,
    }
}

/// True for conjunctions of `COUNT/MAX(..) >= k`, `MIN(..) <= k` and their
/// mirrored forms: bounds that stay satisfied when a group gains rows.
pub fn is_monotone_bound(expr: &Expr) -> bool {
    match expr {
        Expr::Nested(inner) => is_monotone_bound(inner),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => is_monotone_bound(left) && is_monotone_bound(right),
        Expr::BinaryOp { left, op, right } => {
            match (aggregate_name(left), aggregate_name(right)) {
                (Some(agg), None) if is_constant(right) => grows_with_rows(&agg, op, false),
                (None, Some(agg)) if is_constant(left) => grows_with_rows(&agg, op, true),
                _ => false,
            }
        }
        _ => false,
    }
}

fn grows_with_rows(aggregate: &str, op: &BinaryOperator, mirrored: bool) -> bool {
    use BinaryOperator::{Gt, GtEq, Lt, LtEq};
    let lower_bound = matches!((op, mirrored), (Gt | GtEq, false) | (Lt | LtEq, true));
    let upper_bound = matches!((op, mirrored), (Lt | LtEq, false) | (Gt | GtEq, true));
    match aggregate {
        "count" | "max" => lower_bound,
        "min" => upper_bound,
        _ => false,
    }
}

fn aggregate_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Nested(inner) => aggregate_name(inner),
        Expr::Function(function) if function.over.is_none() => {
            let name = function_name(function);
            matches!(name.as_str(), "count" | "max" | "min").then_some(name)
        }
        _ => None,
    }
}

fn is_constant(expr: &Expr) -> bool {
    match expr {
        Expr::Nested(inner) => is_constant(inner),
        Expr::Value(Value::Number(..)) => true,
        Expr::UnaryOp {
            op: UnaryOperator::Minus | UnaryOperator::Plus,
            expr,
        } => is_constant(expr),
        _ => false,
    }
}
