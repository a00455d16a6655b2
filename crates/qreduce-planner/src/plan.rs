//! Symbolic reduction plan.
//!
//! For every scope the plan lists, per relation occurrence, the cheap local
//! conditions that may filter it, the semi-join edges that may shrink it,
//! and an optional group pre-pass. Nothing here touches the engine.
//!
//! Outer joins restrict what is usable:
//!
//! - an ON condition of a LEFT JOIN filters only the join's nullable side;
//! - any other condition may filter a nullable relation only when it rejects
//!   that relation's NULL-extended rows.

use std::collections::BTreeMap;
use std::fmt;

use qreduce_query::{
    is_monotone_bound, Classification, ColumnKey, Condition, ConditionId, ConditionOrigin,
    JoinKind, QueryModel, RelationId, Scope, ScopeId,
};
use tracing::debug;

use crate::PlannerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreducedReason {
    /// No cheap condition touches the relation.
    NoCheapCondition,
    /// Every condition touching the relation depends on an opaque call.
    OpaqueOnly,
    /// Cheap conditions touch the relation but none can be used: they sit
    /// on the preserved side of a LEFT JOIN, read output aliases, or span
    /// more than two relations.
    UnusableConditions,
}

impl fmt::Display for UnreducedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnreducedReason::NoCheapCondition => write!(f, "no cheap condition"),
            UnreducedReason::OpaqueOnly => write!(f, "only opaque-dependent conditions"),
            UnreducedReason::UnusableConditions => write!(f, "cheap conditions are not usable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelationPlan {
    pub relation: RelationId,
    pub alias: String,
    pub local: Vec<ConditionId>,
    /// SQL of `local`, written against `alias`.
    pub local_sql: Vec<String>,
    /// Set when nothing in the plan can shrink this relation.
    pub unreduced: Option<UnreducedReason>,
}

/// `target ⋉ reducer` on `condition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemiJoinEdge {
    pub target: RelationId,
    pub reducer: RelationId,
    pub condition: ConditionId,
    pub sql: String,
}

#[derive(Debug, Clone)]
pub struct GroupPrepass {
    /// Grouping key expressions, in GROUP BY order.
    pub keys: Vec<String>,
    /// Cheap WHERE/ON conditions of the candidate join.
    pub joins: Vec<String>,
    /// Usable HAVING conditions.
    pub having: Vec<String>,
    /// Relations owning plain-column keys: `(key index, column)`.
    pub owners: BTreeMap<RelationId, Vec<(usize, String)>>,
}

#[derive(Debug, Clone)]
pub struct ScopePlan {
    pub scope: ScopeId,
    pub relations: Vec<RelationPlan>,
    pub edges: Vec<SemiJoinEdge>,
    pub prepass: Option<GroupPrepass>,
}

/// Per-scope plans, children before parents.
#[derive(Debug, Clone, Default)]
pub struct ReductionPlan {
    pub scopes: Vec<ScopePlan>,
}

impl ReductionPlan {
    pub fn relation(&self, id: RelationId) -> Option<&RelationPlan> {
        self.scopes
            .iter()
            .flat_map(|scope| scope.relations.iter())
            .find(|plan| plan.relation == id)
    }

    pub fn unreduced(&self) -> impl Iterator<Item = (RelationId, UnreducedReason)> + '_ {
        self.scopes
            .iter()
            .flat_map(|scope| scope.relations.iter())
            .filter_map(|plan| plan.unreduced.map(|reason| (plan.relation, reason)))
    }

    pub fn edge_count(&self) -> usize {
        self.scopes.iter().map(|scope| scope.edges.len()).sum()
    }
}

pub fn plan(
    model: &QueryModel,
    classification: &Classification,
    config: &PlannerConfig,
) -> ReductionPlan {
    // Children have larger ids than their parents.
    let scopes = model
        .scopes
        .iter()
        .rev()
        .map(|scope| plan_scope(model, classification, config, scope))
        .collect();
    ReductionPlan { scopes }
}

fn plan_scope(
    model: &QueryModel,
    classification: &Classification,
    config: &PlannerConfig,
    scope: &Scope,
) -> ScopePlan {
    let mut relations: Vec<RelationPlan> = scope
        .relations
        .iter()
        .map(|&id| RelationPlan {
            relation: id,
            alias: model.relation(id).alias.clone(),
            local: Vec::new(),
            local_sql: Vec::new(),
            unreduced: None,
        })
        .collect();
    let mut edges = Vec::new();

    for &id in &scope.conditions {
        let condition = model.condition(id);
        if !classification.is_cheap(id)
            || condition.references_outputs()
            || condition.origin == ConditionOrigin::Having
        {
            continue;
        }
        let touched: Vec<RelationId> = condition.relations.iter().copied().collect();
        match touched.as_slice() {
            [relation] => {
                if !local_usable(model, condition, *relation) {
                    continue;
                }
                if let Some(plan) = relations.iter_mut().find(|p| p.relation == *relation) {
                    plan.local.push(id);
                    plan.local_sql.push(condition.sql.clone());
                }
            }
            [a, b] => {
                for (target, reducer) in [(*a, *b), (*b, *a)] {
                    if edge_usable(model, condition, target, reducer) {
                        edges.push(SemiJoinEdge {
                            target,
                            reducer,
                            condition: id,
                            sql: condition.sql.clone(),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    let prepass = plan_prepass(model, classification, config, scope);

    for plan in relations.iter_mut() {
        let reducible = !plan.local.is_empty()
            || edges.iter().any(|e| e.target == plan.relation)
            || prepass
                .as_ref()
                .is_some_and(|p| p.owners.contains_key(&plan.relation));
        if reducible {
            continue;
        }
        let (mut cheap, mut opaque) = (false, false);
        for id in &scope.conditions {
            if !model.condition(*id).relations.contains(&plan.relation) {
                continue;
            }
            if classification.is_cheap(*id) {
                cheap = true;
            } else {
                opaque = true;
            }
        }
        plan.unreduced = Some(if cheap {
            UnreducedReason::UnusableConditions
        } else if opaque {
            UnreducedReason::OpaqueOnly
        } else {
            UnreducedReason::NoCheapCondition
        });
    }

    debug!(
        scope = %scope.id,
        relations = relations.len(),
        edges = edges.len(),
        prepass = prepass.is_some(),
        "planned scope"
    );
    ScopePlan {
        scope: scope.id,
        relations,
        edges,
        prepass,
    }
}

fn local_usable(model: &QueryModel, condition: &Condition, relation: RelationId) -> bool {
    match condition.origin {
        ConditionOrigin::On {
            join: JoinKind::Left,
            nullable,
        } => nullable == Some(relation),
        _ => !model.relation(relation).nullable || condition.rejects_nulls_of(relation),
    }
}

fn edge_usable(
    model: &QueryModel,
    condition: &Condition,
    target: RelationId,
    reducer: RelationId,
) -> bool {
    match condition.origin {
        ConditionOrigin::On {
            join: JoinKind::Left,
            nullable,
        } => nullable == Some(target),
        _ => [target, reducer]
            .into_iter()
            .all(|r| !model.relation(r).nullable || condition.rejects_nulls_of(r)),
    }
}

fn plan_prepass(
    model: &QueryModel,
    classification: &Classification,
    config: &PlannerConfig,
    scope: &Scope,
) -> Option<GroupPrepass> {
    if !config.group_prepass || !scope.is_grouped() {
        return None;
    }
    if scope.relations.iter().any(|r| model.relation(*r).nullable) {
        debug!(scope = %scope.id, "no group pre-pass: outer join in scope");
        return None;
    }
    let tainted_key = classification.has_tainted_grouping(scope.id)
        || scope
            .group_by
            .iter()
            .any(|key| key.opaque_lineage || key.columns.iter().any(ColumnKey::is_output));
    if tainted_key {
        debug!(scope = %scope.id, "no group pre-pass: grouping key is not a plain expression");
        return None;
    }

    let cheap = |id: &&ConditionId| {
        let condition = model.condition(**id);
        classification.is_cheap(**id) && !condition.references_outputs()
    };
    // Dropping a conjunct from the pre-pass join can only add rows to a
    // group, which keeps a monotone bound satisfied.
    let having: Vec<String> = scope
        .conditions
        .iter()
        .filter(cheap)
        .map(|id| model.condition(*id))
        .filter(|c| c.origin == ConditionOrigin::Having)
        .filter(|c| !c.has_aggregate || is_monotone_bound(&c.expr))
        .map(|c| c.sql.clone())
        .collect();
    if having.is_empty() {
        return None;
    }

    let mut owners: BTreeMap<RelationId, Vec<(usize, String)>> = BTreeMap::new();
    for (i, key) in scope.group_by.iter().enumerate() {
        if let Some(column) = &key.column {
            owners
                .entry(column.relation)
                .or_default()
                .push((i, column.column.clone()));
        }
    }
    if owners.is_empty() {
        return None;
    }

    let joins = scope
        .conditions
        .iter()
        .filter(cheap)
        .map(|id| model.condition(*id))
        .filter(|c| c.origin != ConditionOrigin::Having)
        .map(|c| c.sql.clone())
        .collect();
    Some(GroupPrepass {
        keys: scope.group_by.iter().map(|key| key.sql.clone()).collect(),
        joins,
        having,
        owners,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qreduce_query::{build_model, classify, Catalog, OpaqueRegistry};

    fn planned(sql: &str) -> (QueryModel, ReductionPlan) {
        planned_with(sql, PlannerConfig::default())
    }

    fn planned_with(sql: &str, config: PlannerConfig) -> (QueryModel, ReductionPlan) {
        let catalog = Catalog::new()
            .with("nodes", &["id", "country", "label"])
            .with("edges", &["src", "dst"]);
        let model = build_model(sql, &catalog, &OpaqueRegistry::default()).expect("build");
        let classes = classify(&model);
        let plan = plan(&model, &classes, &config);
        (model, plan)
    }

    fn by_alias<'p>(model: &QueryModel, plan: &'p ReductionPlan, alias: &str) -> &'p RelationPlan {
        let id = model
            .relations
            .iter()
            .find(|r| r.alias == alias)
            .map(|r| r.id)
            .expect("alias exists");
        plan.relation(id).expect("relation planned")
    }

    fn edge_aliases(model: &QueryModel, plan: &ReductionPlan) -> Vec<(String, String)> {
        plan.scopes
            .iter()
            .flat_map(|s| s.edges.iter())
            .map(|e| {
                (
                    model.relation(e.target).alias.clone(),
                    model.relation(e.reducer).alias.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn inner_joins_yield_edges_both_ways() {
        let (model, plan) = planned(
            "SELECT s.label FROM edges e JOIN nodes s ON e.src = s.id WHERE s.country = 'CA'",
        );
        assert_eq!(by_alias(&model, &plan, "s").local_sql, vec!["s.country = 'CA'"]);
        assert_eq!(
            edge_aliases(&model, &plan),
            vec![("e".into(), "s".into()), ("s".into(), "e".into())]
        );
        assert!(plan.unreduced().next().is_none());
    }

    #[test]
    fn left_join_on_reduces_only_the_nullable_side() {
        let (model, plan) = planned(
            "SELECT n.id FROM nodes n LEFT JOIN edges e ON e.src = n.id AND e.dst > 3 \
             AND n.country = 'CA'",
        );
        assert_eq!(by_alias(&model, &plan, "e").local_sql, vec!["e.dst > 3"]);
        assert!(by_alias(&model, &plan, "n").local.is_empty());
        assert_eq!(edge_aliases(&model, &plan), vec![("e".into(), "n".into())]);
        assert_eq!(
            by_alias(&model, &plan, "n").unreduced,
            Some(UnreducedReason::UnusableConditions)
        );
    }

    #[test]
    fn where_conditions_need_null_rejection_on_the_nullable_side() {
        let (model, plan) = planned(
            "SELECT n.id FROM nodes n LEFT JOIN edges e ON e.src = n.id \
             WHERE e.dst IS NULL AND n.country = 'CA'",
        );
        assert!(by_alias(&model, &plan, "e").local.is_empty());

        let (model, plan) = planned(
            "SELECT n.id FROM nodes n LEFT JOIN edges e ON e.src = n.id WHERE e.dst = n.id",
        );
        let edges = edge_aliases(&model, &plan);
        assert!(edges.contains(&("n".into(), "e".into())), "edges={edges:?}");
        assert!(edges.contains(&("e".into(), "n".into())), "edges={edges:?}");
    }

    #[test]
    fn opaque_conditions_are_never_planned() {
        let (model, plan) = planned(
            "SELECT n.id FROM nodes n, edges e WHERE llm_filter('m', 'p', n.label, e.src)",
        );
        assert_eq!(plan.edge_count(), 0);
        assert_eq!(
            by_alias(&model, &plan, "n").unreduced,
            Some(UnreducedReason::OpaqueOnly)
        );
        assert_eq!(
            by_alias(&model, &plan, "e").unreduced,
            Some(UnreducedReason::OpaqueOnly)
        );
    }

    #[test]
    fn untouched_relation_reports_no_cheap_condition() {
        let (model, plan) = planned("SELECT n.id FROM nodes n, edges e WHERE n.id > 1");
        assert_eq!(
            by_alias(&model, &plan, "e").unreduced,
            Some(UnreducedReason::NoCheapCondition)
        );
    }

    #[test]
    fn three_way_conditions_are_skipped() {
        let (_, plan) = planned(
            "SELECT e.src FROM edges e, nodes s, nodes d WHERE e.src + e.dst = s.id + d.id",
        );
        assert_eq!(plan.edge_count(), 0);
    }

    #[test]
    fn scopes_are_planned_children_first() {
        let (_, plan) = planned(
            "SELECT x.src FROM (SELECT src FROM edges WHERE dst > 1) AS x \
             WHERE x.src IN (SELECT id FROM nodes WHERE country = 'CA')",
        );
        let order: Vec<usize> = plan.scopes.iter().map(|s| s.scope.index()).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn group_prepass_needs_a_monotone_bound_and_a_plain_key() {
        let sql = "SELECT s.country, count(*) FROM edges e \
                   JOIN nodes s ON e.src = s.id JOIN nodes d ON e.dst = d.id \
                   WHERE d.country = 'CA' GROUP BY s.country HAVING count(*) >= 2";
        let (model, plan) = planned(sql);
        let prepass = plan.scopes[0].prepass.as_ref().expect("pre-pass planned");
        assert_eq!(prepass.keys, vec!["s.country"]);
        assert_eq!(prepass.having, vec!["count(*) >= 2"]);
        assert_eq!(prepass.joins.len(), 3);
        let owner = model
            .relations
            .iter()
            .find(|r| r.alias == "s")
            .map(|r| r.id)
            .expect("s");
        assert_eq!(prepass.owners[&owner], vec![(0, "country".to_string())]);

        let (_, plan) = planned(&sql.replace(">= 2", "<= 2"));
        assert!(plan.scopes[0].prepass.is_none());

        let (_, plan) = planned_with(
            sql,
            PlannerConfig {
                group_prepass: false,
                ..PlannerConfig::default()
            },
        );
        assert!(plan.scopes[0].prepass.is_none());
    }

    #[test]
    fn group_prepass_skips_outer_joins() {
        let (_, plan) = planned(
            "SELECT n.country, count(*) FROM nodes n LEFT JOIN edges e ON e.src = n.id \
             GROUP BY n.country HAVING count(*) >= 2",
        );
        assert!(plan.scopes[0].prepass.is_none());
    }
}
