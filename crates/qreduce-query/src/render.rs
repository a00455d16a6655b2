//! Rendering of the stubbed query, optionally pointed at other relations.
//!
//! Stubbing happens on the AST: every call to a registered opaque function
//! is replaced by [`OpaqueKind::stub`](crate::OpaqueKind::stub). Aliases are
//! untouched, so the stubbed query has the same output columns as the
//! original.
//!
//! Rebinding renames base tables in every FROM clause (including derived
//! tables and subqueries). A table without an alias gets its old name as
//! alias so qualified column references keep resolving.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions_mut, Expr, Ident, ObjectName, Query, SetExpr, Statement, TableAlias,
    TableFactor, VisitMut,
};

use crate::builder::function_name;
use crate::model::QueryModel;
use crate::opaque::OpaqueRegistry;

pub(crate) fn stub_opaque_calls<V: VisitMut>(node: &mut V, registry: &OpaqueRegistry) {
    let _ = visit_expressions_mut(node, |expr| {
        if let Expr::Function(function) = expr {
            if let Some(kind) = registry.kind(&function_name(function)) {
                *expr = kind.stub();
            }
        }
        ControlFlow::<()>::Continue(())
    });
}

/// The stubbed query, as run against the original relations.
pub fn stubbed_sql(model: &QueryModel) -> String {
    model.stubbed.to_string()
}

/// The stubbed query with base tables renamed through `bindings`
/// (lower-cased table name to replacement relation name).
pub fn rebound_sql(model: &QueryModel, bindings: &BTreeMap<String, String>) -> String {
    rebind(&model.stubbed, bindings).to_string()
}

pub fn rebind(statement: &Statement, bindings: &BTreeMap<String, String>) -> Statement {
    let mut statement = statement.clone();
    if let Statement::Query(query) = &mut statement {
        rebind_query(query, bindings);
    }
    let _ = visit_expressions_mut(&mut statement, |expr| {
        match expr {
            Expr::InSubquery { subquery, .. } | Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => {
                rebind_query(subquery, bindings)
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    statement
}

fn rebind_query(query: &mut Query, bindings: &BTreeMap<String, String>) {
    let SetExpr::Select(select) = query.body.as_mut() else {
        return;
    };
    for item in select.from.iter_mut() {
        rebind_factor(&mut item.relation, bindings);
        for join in item.joins.iter_mut() {
            rebind_factor(&mut join.relation, bindings);
        }
    }
}

fn rebind_factor(factor: &mut TableFactor, bindings: &BTreeMap<String, String>) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let Some(last) = name.0.last().cloned() else {
                return;
            };
            let Some(target) = bindings.get(&last.value.to_ascii_lowercase()) else {
                return;
            };
            if alias.is_none() {
                *alias = Some(TableAlias {
                    name: last,
                    columns: Vec::new(),
                });
            }
            *name = ObjectName(vec![Ident::new(target.clone())]);
        }
        TableFactor::Derived { subquery, .. } => rebind_query(subquery, bindings),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Catalog, OpaqueRegistry, QueryModelBuilder};

    fn catalog() -> Catalog {
        Catalog::new()
            .with("nodes", &["id", "country", "label"])
            .with("edges", &["src", "dst"])
    }

    fn build(sql: &str) -> QueryModel {
        let catalog = catalog();
        let registry = OpaqueRegistry::default();
        QueryModelBuilder::new(&catalog, &registry)
            .build(sql)
            .expect("build")
    }

    #[test]
    fn stubs_calls_and_opaque_conjuncts() {
        let model = build(
            "SELECT n.id, llm_complete('m', 'describe', n.label) AS blurb \
             FROM nodes n \
             WHERE n.country = 'CA' AND llm_filter('m', 'keep?', n.label)",
        );
        assert_eq!(
            stubbed_sql(&model),
            "SELECT n.id, NULL AS blurb FROM nodes AS n WHERE n.country = 'CA' AND true"
        );
    }

    #[test]
    fn conjunct_reading_opaque_output_becomes_true() {
        let model = build(
            "SELECT n.id, llm_complete('m', 'p', n.label) AS blurb FROM nodes n \
             WHERE blurb LIKE '%x%' AND n.id > 1",
        );
        assert_eq!(
            stubbed_sql(&model),
            "SELECT n.id, NULL AS blurb FROM nodes AS n WHERE true AND n.id > 1"
        );
    }

    #[test]
    fn opaque_ordering_drops_the_limit() {
        let model = build(
            "SELECT n.id, llm_rerank('m', 'best', n.label) AS r FROM nodes n ORDER BY r LIMIT 2",
        );
        assert_eq!(stubbed_sql(&model), "SELECT n.id, NULL AS r FROM nodes AS n");

        // A cheap key still decides which rows are kept.
        let model = build(
            "SELECT n.id, llm_rerank('m', 'best', n.label) AS r FROM nodes n \
             ORDER BY n.id, r LIMIT 2",
        );
        assert_eq!(
            stubbed_sql(&model),
            "SELECT n.id, NULL AS r FROM nodes AS n ORDER BY n.id, r LIMIT 2"
        );
    }

    #[test]
    fn rebinding_keeps_old_name_as_alias() {
        let model = build(
            "SELECT edges.src FROM edges JOIN nodes d ON edges.dst = d.id \
             WHERE d.id IN (SELECT id FROM nodes WHERE country = 'CA')",
        );
        let bindings = BTreeMap::from([
            ("edges".to_string(), "qr_1".to_string()),
            ("nodes".to_string(), "qr_2".to_string()),
        ]);
        assert_eq!(
            rebound_sql(&model, &bindings),
            "SELECT edges.src FROM qr_1 AS edges JOIN qr_2 AS d ON edges.dst = d.id \
             WHERE d.id IN (SELECT id FROM qr_2 AS nodes WHERE country = 'CA')"
        );
    }

    #[test]
    fn rebinding_reaches_derived_tables() {
        let model = build("SELECT x.src FROM (SELECT src FROM edges) AS x");
        let bindings = BTreeMap::from([("edges".to_string(), "qr_7".to_string())]);
        assert_eq!(
            rebound_sql(&model, &bindings),
            "SELECT x.src FROM (SELECT src FROM qr_7 AS edges) AS x"
        );
    }
}
