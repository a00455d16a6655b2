//! Lowering of SQL text into a [`QueryModel`].
//!
//! Motivation
//! ----------
//! The planner reasons about relations, join conditions and the columns an
//! opaque call reads. `sqlparser` gives us a faithful AST; this module walks
//! it once, resolves every column reference against the catalog, and records
//! the result in the flat arena of [`crate::model`].
//!
//! The walk runs over a mutable copy of the statement. Whenever a conjunct
//! turns out to depend on an opaque call it is replaced by `TRUE` in that
//! copy, and at the end every opaque call is stubbed. The copy becomes
//! [`QueryModel::stubbed`]: the opaque-free query that both verification runs
//! execute.

use std::collections::BTreeSet;

use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, Ident,
    JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::error::{ModelError, ParseError, ResolutionError};
use crate::model::{
    ColumnKey, ColumnRef, Condition, ConditionId, ConditionKind, ConditionOrigin, GroupKey,
    JoinKind, OpaqueCall, OpaqueCallId, OpaqueSite, OutputColumn, QueryModel, Relation,
    RelationId, RelationSource, Scope, ScopeId, ScopeKind,
};
use crate::opaque::OpaqueRegistry;
use crate::render::stub_opaque_calls;

const AGGREGATES: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "total",
    "group_concat",
    "string_agg",
];

/// Scalar functions that return NULL whenever an argument is NULL.
const STRICT_FUNCTIONS: &[&str] = &[
    "abs", "instr", "length", "lower", "ltrim", "replace", "round", "rtrim", "substr",
    "substring", "trim", "upper",
];

pub struct QueryModelBuilder<'a> {
    catalog: &'a Catalog,
    registry: &'a OpaqueRegistry,
}

impl<'a> QueryModelBuilder<'a> {
    pub fn new(catalog: &'a Catalog, registry: &'a OpaqueRegistry) -> Self {
        Self { catalog, registry }
    }

    pub fn build(&self, text: &str) -> Result<QueryModel, ModelError> {
        let dialect = GenericDialect {};
        let mut statements =
            Parser::parse_sql(&dialect, text).map_err(|e| ParseError::Syntax(e.to_string()))?;
        if statements.len() != 1 {
            return Err(ParseError::StatementCount(statements.len()).into());
        }
        let statement = statements.remove(0);

        let mut stubbed = statement.clone();
        let Statement::Query(query) = &mut stubbed else {
            return Err(ParseError::NotAQuery.into());
        };

        let mut lowering = Lowering {
            catalog: self.catalog,
            registry: self.registry,
            scopes: Vec::new(),
            relations: Vec::new(),
            conditions: Vec::new(),
            calls: Vec::new(),
        };
        lowering.lower_query(query, ScopeKind::Root, None)?;
        stub_opaque_calls(&mut stubbed, self.registry);

        debug!(
            scopes = lowering.scopes.len(),
            relations = lowering.relations.len(),
            conditions = lowering.conditions.len(),
            opaque_calls = lowering.calls.len(),
            "built query model"
        );

        Ok(QueryModel {
            text: text.to_string(),
            statement,
            stubbed,
            scopes: lowering.scopes,
            relations: lowering.relations,
            conditions: lowering.conditions,
            opaque_calls: lowering.calls,
            registry: self.registry.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ExprCtx {
    scope: ScopeId,
    site: OpaqueSite,
    allow_outputs: bool,
    in_opaque_args: bool,
}

impl ExprCtx {
    fn new(scope: ScopeId, site: OpaqueSite, allow_outputs: bool) -> Self {
        Self {
            scope,
            site,
            allow_outputs,
            in_opaque_args: false,
        }
    }
}

/// What one expression touches.
#[derive(Debug, Default)]
struct ExprFacts {
    columns: BTreeSet<ColumnKey>,
    calls: Vec<OpaqueCallId>,
    subqueries: Vec<ScopeId>,
    has_aggregate: bool,
    opaque_lineage: bool,
}

impl ExprFacts {
    fn merge(&mut self, other: ExprFacts) {
        self.columns.extend(other.columns);
        self.calls.extend(other.calls);
        self.subqueries.extend(other.subqueries);
        self.has_aggregate |= other.has_aggregate;
        self.opaque_lineage |= other.opaque_lineage;
    }
}

struct PendingOn {
    expr: Expr,
    join: JoinKind,
    nullable: Option<RelationId>,
    /// `(from item, join)` position of a written ON clause; `None` for USING.
    slot: Option<(usize, usize)>,
}

struct Lowering<'a> {
    catalog: &'a Catalog,
    registry: &'a OpaqueRegistry,
    scopes: Vec<Scope>,
    relations: Vec<Relation>,
    conditions: Vec<Condition>,
    calls: Vec<OpaqueCall>,
}

impl Lowering<'_> {
    // ------------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------------

    fn lower_query(
        &mut self,
        query: &mut Query,
        kind: ScopeKind,
        parent: Option<ScopeId>,
    ) -> Result<ScopeId, ModelError> {
        if query.with.is_some() {
            return Err(ParseError::unsupported("WITH clause").into());
        }
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope::new(id, kind, parent));

        let select: &mut Select = match query.body.as_mut() {
            SetExpr::Select(select) => select.as_mut(),
            SetExpr::SetOperation { op, .. } => {
                return Err(ParseError::unsupported(format!("set operation {op}")).into())
            }
            other => {
                return Err(ParseError::unsupported(format!("query body `{other}`")).into())
            }
        };
        if matches!(select.distinct, Some(Distinct::On(_))) {
            return Err(ParseError::unsupported("DISTINCT ON").into());
        }

        // FROM, collecting ON clauses until every relation of the scope is known.
        let mut pending = Vec::new();
        for (i, item) in select.from.iter_mut().enumerate() {
            let first = self.lower_table_factor(id, &mut item.relation, false)?;
            let mut left = vec![first];
            for (j, join) in item.joins.iter_mut().enumerate() {
                let join_kind = match &join.join_operator {
                    JoinOperator::Inner(_) | JoinOperator::CrossJoin => JoinKind::Inner,
                    JoinOperator::LeftOuter(_) => JoinKind::Left,
                    other => return Err(ParseError::unsupported(join_name(other)).into()),
                };
                let right = self.lower_table_factor(id, &mut join.relation, join_kind == JoinKind::Left)?;
                let nullable = (join_kind == JoinKind::Left).then_some(right);
                let constraint = match &mut join.join_operator {
                    JoinOperator::Inner(constraint) | JoinOperator::LeftOuter(constraint) => {
                        Some(constraint)
                    }
                    _ => None,
                };
                match constraint {
                    Some(JoinConstraint::On(expr)) => {
                        let expr = std::mem::replace(expr, true_expr());
                        pending.push(PendingOn {
                            expr,
                            join: join_kind,
                            nullable,
                            slot: Some((i, j)),
                        });
                    }
                    Some(JoinConstraint::Using(columns)) => {
                        for column in columns.iter() {
                            let expr = self.using_equality(&left, right, &column.value)?;
                            pending.push(PendingOn {
                                expr,
                                join: join_kind,
                                nullable,
                                slot: None,
                            });
                        }
                    }
                    Some(JoinConstraint::Natural) => {
                        return Err(ParseError::unsupported("NATURAL join").into())
                    }
                    Some(JoinConstraint::None) | None => {}
                }
                left.push(right);
            }
        }

        // SELECT list. Outputs are visible to the clauses lowered after it.
        let mut outputs = Vec::new();
        for item in select.projection.iter_mut() {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    let display = default_output_name(expr);
                    outputs.push(self.lower_output(id, expr, display, false)?);
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    outputs.push(self.lower_output(id, expr, alias.value.clone(), true)?);
                }
                SelectItem::Wildcard(_) => {
                    for relation in self.scopes[id.0].relations.clone() {
                        outputs.extend(self.wildcard_outputs(relation));
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name.0.last().map(|i| i.value.as_str()).unwrap_or_default();
                    let relation = self
                        .relation_by_alias(id, qualifier)
                        .ok_or_else(|| ResolutionError::UnknownRelation(name.to_string()))?;
                    outputs.extend(self.wildcard_outputs(relation));
                }
            }
        }
        self.scopes[id.0].outputs = outputs;

        for on in pending {
            let origin = ConditionOrigin::On {
                join: on.join,
                nullable: on.nullable,
            };
            let mut kept = Vec::new();
            for conjunct in split_conjuncts(on.expr) {
                kept.push(self.lower_condition(id, conjunct, origin)?);
            }
            if let Some((i, j)) = on.slot {
                if let Some(slot) = on_clause_mut(select, i, j) {
                    *slot = join_conjuncts(kept).unwrap_or_else(true_expr);
                }
            }
        }

        if let Some(selection) = select.selection.take() {
            let mut kept = Vec::new();
            for conjunct in split_conjuncts(selection) {
                kept.push(self.lower_condition(id, conjunct, ConditionOrigin::Where)?);
            }
            select.selection = join_conjuncts(kept);
        }

        match &mut select.group_by {
            GroupByExpr::All => return Err(ParseError::unsupported("GROUP BY ALL").into()),
            GroupByExpr::Expressions(exprs) => {
                for expr in exprs.iter_mut() {
                    let key = self.lower_group_key(id, expr)?;
                    self.scopes[id.0].group_by.push(key);
                }
            }
        }

        if let Some(having) = select.having.take() {
            let mut kept = Vec::new();
            for conjunct in split_conjuncts(having) {
                kept.push(self.lower_condition(id, conjunct, ConditionOrigin::Having)?);
            }
            select.having = join_conjuncts(kept);
        }
        let distinct = select.distinct.is_some();

        let mut opaque_keys = 0;
        for item in query.order_by.iter_mut() {
            if matches!(item.expr, Expr::Value(_)) {
                continue;
            }
            let ctx = ExprCtx::new(id, OpaqueSite::OrderBy, true);
            let mut facts = ExprFacts::default();
            self.analyze_expr(&mut item.expr, ctx, &mut facts)?;
            if !facts.calls.is_empty() || facts.opaque_lineage {
                opaque_keys += 1;
            }
        }

        let ordered = !query.order_by.is_empty();
        let limited = query.limit.is_some() || query.offset.is_some() || query.fetch.is_some();
        if limited && !ordered {
            warn!(scope = %id, "LIMIT without ORDER BY: the kept rows may differ between runs");
        }
        // Stubbed keys order nothing, so both verification runs would keep
        // arbitrary rows. Compare the whole ordered input instead.
        if limited && ordered && opaque_keys == query.order_by.len() {
            debug!(scope = %id, "every ORDER BY key is opaque: verifying without LIMIT");
            query.order_by.clear();
            query.limit = None;
            query.offset = None;
            query.fetch = None;
        }

        let mut stubbed = query.clone();
        stub_opaque_calls(&mut stubbed, self.registry);
        let scope = &mut self.scopes[id.0];
        scope.distinct = distinct;
        scope.ordered = ordered;
        scope.limited = limited;
        scope.opaque_order = opaque_keys > 0;
        scope.stubbed_sql = stubbed.to_string();
        Ok(id)
    }

    fn lower_table_factor(
        &mut self,
        scope: ScopeId,
        factor: &mut TableFactor,
        nullable: bool,
    ) -> Result<RelationId, ModelError> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                let entry = self
                    .catalog
                    .lookup(&table)
                    .ok_or_else(|| ResolutionError::UnknownRelation(name.to_string()))?;
                if alias.as_ref().is_some_and(|a| !a.columns.is_empty()) {
                    return Err(ParseError::unsupported("column alias list on a table").into());
                }
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table.clone());
                let source = RelationSource::Base {
                    table: entry.name.clone(),
                };
                let columns = entry.columns.clone();
                self.add_relation(scope, alias, source, columns, nullable)
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
                ..
            } => {
                if *lateral {
                    return Err(ParseError::unsupported("LATERAL derived table").into());
                }
                let Some(alias) = alias.as_ref() else {
                    return Err(ParseError::unsupported("derived table without an alias").into());
                };
                if !alias.columns.is_empty() {
                    return Err(ParseError::unsupported("column alias list on a derived table").into());
                }
                let alias = alias.name.value.clone();
                let inner = self.lower_query(subquery, ScopeKind::Derived, Some(scope))?;
                let columns = self.scopes[inner.0]
                    .outputs
                    .iter()
                    .map(|o| o.display.clone())
                    .collect();
                let source = RelationSource::Derived { scope: inner };
                self.add_relation(scope, alias, source, columns, nullable)
            }
            TableFactor::NestedJoin { .. } => {
                Err(ParseError::unsupported("parenthesized join").into())
            }
            TableFactor::TableFunction { .. } => {
                Err(ParseError::unsupported("table function").into())
            }
            other => Err(ParseError::unsupported(format!("FROM item `{other}`")).into()),
        }
    }

    fn add_relation(
        &mut self,
        scope: ScopeId,
        alias: String,
        source: RelationSource,
        columns: Vec<String>,
        nullable: bool,
    ) -> Result<RelationId, ModelError> {
        if self.relation_by_alias(scope, &alias).is_some() {
            return Err(ResolutionError::DuplicateAlias(alias).into());
        }
        let id = RelationId(self.relations.len());
        self.relations.push(Relation {
            id,
            scope,
            alias,
            source,
            columns,
            nullable,
        });
        self.scopes[scope.0].relations.push(id);
        Ok(id)
    }

    /// `USING (col)` as `left.col = right.col`.
    fn using_equality(
        &self,
        left: &[RelationId],
        right: RelationId,
        column: &str,
    ) -> Result<Expr, ModelError> {
        let owners: Vec<RelationId> = left
            .iter()
            .copied()
            .filter(|r| self.relations[r.0].has_column(column))
            .collect();
        let owner = match owners.as_slice() {
            [owner] => *owner,
            [] => return Err(ResolutionError::UnknownColumn(column.to_string()).into()),
            many => {
                return Err(ResolutionError::AmbiguousColumn {
                    column: column.to_string(),
                    candidates: self.qualified_names(many, column),
                }
                .into())
            }
        };
        if !self.relations[right.0].has_column(column) {
            return Err(ResolutionError::UnknownColumn(format!(
                "{}.{column}",
                self.relations[right.0].alias
            ))
            .into());
        }
        let qualified = |relation: RelationId| {
            Expr::CompoundIdentifier(vec![
                Ident::new(self.relations[relation.0].alias.clone()),
                Ident::new(column),
            ])
        };
        Ok(Expr::BinaryOp {
            left: Box::new(qualified(owner)),
            op: BinaryOperator::Eq,
            right: Box::new(qualified(right)),
        })
    }

    // ------------------------------------------------------------------------
    // Clauses
    // ------------------------------------------------------------------------

    fn lower_output(
        &mut self,
        scope: ScopeId,
        expr: &mut Expr,
        display: String,
        aliased: bool,
    ) -> Result<OutputColumn, ModelError> {
        let mut facts = ExprFacts::default();
        self.analyze_expr(expr, ExprCtx::new(scope, OpaqueSite::Select, false), &mut facts)?;
        if aliased {
            for call in &facts.calls {
                self.calls[call.0].output = Some(display.clone());
            }
        }
        Ok(OutputColumn {
            name: display.to_ascii_lowercase(),
            display,
            sql: expr.to_string(),
            column: self.plain_column(scope, expr),
            aggregate: facts.has_aggregate,
            opaque_lineage: facts.opaque_lineage || !facts.calls.is_empty(),
            opaque_calls: facts.calls,
            sources: facts.columns,
        })
    }

    fn wildcard_outputs(&self, relation: RelationId) -> Vec<OutputColumn> {
        let rel = &self.relations[relation.0];
        rel.columns
            .iter()
            .map(|column| {
                let column_ref = ColumnRef {
                    relation,
                    column: column.to_ascii_lowercase(),
                };
                let key = ColumnKey::Relation(column_ref.clone());
                OutputColumn {
                    name: column.to_ascii_lowercase(),
                    display: column.clone(),
                    sql: format!("{}.{column}", rel.alias),
                    opaque_lineage: self.lineage(&key),
                    sources: BTreeSet::from([key]),
                    aggregate: false,
                    opaque_calls: Vec::new(),
                    column: Some(column_ref),
                }
            })
            .collect()
    }

    fn lower_condition(
        &mut self,
        scope: ScopeId,
        mut expr: Expr,
        origin: ConditionOrigin,
    ) -> Result<Expr, ModelError> {
        let allow_outputs = !matches!(origin, ConditionOrigin::On { .. });
        let ctx = ExprCtx::new(scope, origin.site(), allow_outputs);
        let mut facts = ExprFacts::default();
        self.analyze_expr(&mut expr, ctx, &mut facts)?;

        let relations: BTreeSet<RelationId> =
            facts.columns.iter().filter_map(ColumnKey::relation).collect();
        let null_rejecting = relations
            .iter()
            .copied()
            .filter(|&relation| self.rejects_nulls(scope, &expr, relation))
            .collect();
        let opaque_dependent = !facts.calls.is_empty() || facts.opaque_lineage;

        let id = ConditionId(self.conditions.len());
        self.conditions.push(Condition {
            id,
            scope,
            sql: expr.to_string(),
            expr: expr.clone(),
            origin,
            kind: condition_kind(&expr, !facts.calls.is_empty()),
            columns: facts.columns,
            relations,
            subqueries: facts.subqueries,
            has_aggregate: facts.has_aggregate,
            null_rejecting,
            opaque_dependent,
            opaque_calls: facts.calls,
        });
        self.scopes[scope.0].conditions.push(id);

        if opaque_dependent {
            Ok(true_expr())
        } else {
            Ok(expr)
        }
    }

    fn lower_group_key(&mut self, scope: ScopeId, expr: &mut Expr) -> Result<GroupKey, ModelError> {
        if let Expr::Value(Value::Number(position, _)) = expr {
            let output = position
                .parse::<usize>()
                .ok()
                .and_then(|p| p.checked_sub(1))
                .and_then(|i| self.scopes[scope.0].outputs.get(i))
                .ok_or_else(|| {
                    ResolutionError::UnknownColumn(format!("GROUP BY position {position}"))
                })?;
            return Ok(group_key_of_output(output));
        }
        if let Expr::Identifier(ident) = expr {
            if let Ok(ColumnKey::Output { name, .. }) = self.resolve(scope, None, &ident.value, true)
            {
                if let Some(output) = self.scopes[scope.0].output(&name) {
                    return Ok(group_key_of_output(output));
                }
            }
        }

        let mut facts = ExprFacts::default();
        self.analyze_expr(expr, ExprCtx::new(scope, OpaqueSite::GroupBy, true), &mut facts)?;
        Ok(GroupKey {
            sql: expr.to_string(),
            column: self.plain_column(scope, expr),
            opaque_lineage: facts.opaque_lineage || !facts.calls.is_empty(),
            columns: facts.columns,
        })
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn analyze_expr(
        &mut self,
        expr: &mut Expr,
        ctx: ExprCtx,
        facts: &mut ExprFacts,
    ) -> Result<(), ModelError> {
        match expr {
            Expr::Identifier(ident) => self.add_column(ctx, None, &ident.value, facts),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [column] => self.add_column(ctx, None, &column.value, facts),
                [.., qualifier, column] => {
                    self.add_column(ctx, Some(&qualifier.value), &column.value, facts)
                }
                [] => Ok(()),
            },
            Expr::Value(_) | Expr::TypedString { .. } => Ok(()),
            Expr::BinaryOp { left, right, .. } => {
                self.analyze_expr(left, ctx, facts)?;
                self.analyze_expr(right, ctx, facts)
            }
            Expr::UnaryOp { expr: inner, .. }
            | Expr::Nested(inner)
            | Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::Cast { expr: inner, .. }
            | Expr::TryCast { expr: inner, .. } => self.analyze_expr(inner, ctx, facts),
            Expr::InList { expr: inner, list, .. } => {
                self.analyze_expr(inner, ctx, facts)?;
                for item in list.iter_mut() {
                    self.analyze_expr(item, ctx, facts)?;
                }
                Ok(())
            }
            Expr::Between {
                expr: inner,
                low,
                high,
                ..
            } => {
                self.analyze_expr(inner, ctx, facts)?;
                self.analyze_expr(low, ctx, facts)?;
                self.analyze_expr(high, ctx, facts)
            }
            Expr::Like {
                expr: inner,
                pattern,
                ..
            }
            | Expr::ILike {
                expr: inner,
                pattern,
                ..
            } => {
                self.analyze_expr(inner, ctx, facts)?;
                self.analyze_expr(pattern, ctx, facts)
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand.as_mut() {
                    self.analyze_expr(operand, ctx, facts)?;
                }
                for item in conditions.iter_mut().chain(results.iter_mut()) {
                    self.analyze_expr(item, ctx, facts)?;
                }
                if let Some(else_result) = else_result.as_mut() {
                    self.analyze_expr(else_result, ctx, facts)?;
                }
                Ok(())
            }
            Expr::Tuple(items) => {
                for item in items.iter_mut() {
                    self.analyze_expr(item, ctx, facts)?;
                }
                Ok(())
            }
            Expr::InSubquery {
                expr: inner,
                subquery,
                ..
            } => {
                self.analyze_expr(inner, ctx, facts)?;
                self.lower_subquery(subquery, ctx, facts)
            }
            Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => {
                self.lower_subquery(subquery, ctx, facts)
            }
            Expr::Function(function) => self.analyze_function(function, ctx, facts),
            other => Err(ParseError::unsupported(format!("expression `{other}`")).into()),
        }
    }

    fn analyze_function(
        &mut self,
        function: &mut Function,
        ctx: ExprCtx,
        facts: &mut ExprFacts,
    ) -> Result<(), ModelError> {
        let name = function_name(function);
        if function.over.is_some() {
            return Err(ParseError::unsupported(format!("window function `{}`", function.name)).into());
        }

        let Some(kind) = self.registry.kind(&name) else {
            if AGGREGATES.contains(&name.as_str()) {
                facts.has_aggregate = true;
            }
            for arg in function.args.iter_mut() {
                let (FunctionArg::Unnamed(arg) | FunctionArg::Named { arg, .. }) = arg;
                if let FunctionArgExpr::Expr(expr) = arg {
                    self.analyze_expr(expr, ctx, facts)?;
                }
            }
            return Ok(());
        };

        if ctx.in_opaque_args {
            return Err(ParseError::unsupported(format!("nested opaque call `{}`", function.name)).into());
        }
        let arg_ctx = ExprCtx {
            in_opaque_args: true,
            ..ctx
        };
        let mut config = Vec::new();
        let mut inputs = ExprFacts::default();
        for arg in function.args.iter_mut() {
            let (FunctionArg::Unnamed(arg) | FunctionArg::Named { arg, .. }) = arg;
            match arg {
                FunctionArgExpr::Expr(Expr::Value(
                    Value::SingleQuotedString(text) | Value::DoubleQuotedString(text),
                )) => config.push(text.clone()),
                FunctionArgExpr::Expr(expr) => self.analyze_expr(expr, arg_ctx, &mut inputs)?,
                FunctionArgExpr::Wildcard => {
                    for relation in self.scopes[ctx.scope.0].relations.clone() {
                        self.add_all_columns(relation, &mut inputs);
                    }
                }
                FunctionArgExpr::QualifiedWildcard(qualifier) => {
                    let alias = qualifier.0.last().map(|i| i.value.as_str()).unwrap_or_default();
                    let relation = self
                        .relation_by_alias(ctx.scope, alias)
                        .ok_or_else(|| ResolutionError::UnknownRelation(qualifier.to_string()))?;
                    self.add_all_columns(relation, &mut inputs);
                }
            }
        }

        let id = OpaqueCallId(self.calls.len());
        self.calls.push(OpaqueCall {
            id,
            kind,
            function: name,
            scope: ctx.scope,
            site: ctx.site,
            config,
            context: inputs.columns.clone(),
            output: None,
        });
        self.scopes[ctx.scope.0].opaque_calls.push(id);
        facts.merge(inputs);
        facts.calls.push(id);
        facts.has_aggregate |= kind.is_aggregate();
        Ok(())
    }

    fn lower_subquery(
        &mut self,
        query: &mut Query,
        ctx: ExprCtx,
        facts: &mut ExprFacts,
    ) -> Result<(), ModelError> {
        if ctx.in_opaque_args {
            return Err(ParseError::unsupported("subquery inside opaque call arguments").into());
        }
        let inner = self.lower_query(query, ScopeKind::Subquery, Some(ctx.scope))?;
        facts.subqueries.push(inner);
        if self.subtree_has_opaque(inner) {
            facts.opaque_lineage = true;
        }
        Ok(())
    }

    fn add_column(
        &self,
        ctx: ExprCtx,
        qualifier: Option<&str>,
        column: &str,
        facts: &mut ExprFacts,
    ) -> Result<(), ModelError> {
        let key = self.resolve(ctx.scope, qualifier, column, ctx.allow_outputs)?;
        if self.lineage(&key) {
            facts.opaque_lineage = true;
        }
        facts.columns.insert(key);
        Ok(())
    }

    fn add_all_columns(&self, relation: RelationId, facts: &mut ExprFacts) {
        for column in &self.relations[relation.0].columns {
            let key = ColumnKey::Relation(ColumnRef {
                relation,
                column: column.to_ascii_lowercase(),
            });
            if self.lineage(&key) {
                facts.opaque_lineage = true;
            }
            facts.columns.insert(key);
        }
    }

    // ------------------------------------------------------------------------
    // Name resolution
    // ------------------------------------------------------------------------

    fn resolve(
        &self,
        scope: ScopeId,
        qualifier: Option<&str>,
        column: &str,
        allow_outputs: bool,
    ) -> Result<ColumnKey, ModelError> {
        let name = column.to_ascii_lowercase();
        let Some(qualifier) = qualifier else {
            let owners: Vec<RelationId> = self.scopes[scope.0]
                .relations
                .iter()
                .copied()
                .filter(|r| self.relations[r.0].has_column(column))
                .collect();
            return match owners.as_slice() {
                [relation] => Ok(ColumnKey::Relation(ColumnRef {
                    relation: *relation,
                    column: name,
                })),
                [] if allow_outputs && self.scopes[scope.0].output(column).is_some() => {
                    Ok(ColumnKey::Output { scope, name })
                }
                [] => {
                    let correlated = self.ancestors(scope).into_iter().any(|outer| {
                        self.scopes[outer.0]
                            .relations
                            .iter()
                            .any(|r| self.relations[r.0].has_column(column))
                    });
                    if correlated {
                        Err(correlated_error(column))
                    } else {
                        Err(ResolutionError::UnknownColumn(column.to_string()).into())
                    }
                }
                many => Err(ResolutionError::AmbiguousColumn {
                    column: column.to_string(),
                    candidates: self.qualified_names(many, column),
                }
                .into()),
            };
        };

        let qualified = format!("{qualifier}.{column}");
        let Some(relation) = self.relation_by_alias(scope, qualifier) else {
            if self
                .ancestors(scope)
                .into_iter()
                .any(|outer| self.relation_by_alias(outer, qualifier).is_some())
            {
                return Err(correlated_error(&qualified));
            }
            return Err(ResolutionError::UnknownRelation(qualifier.to_string()).into());
        };
        let hits = self.relations[relation.0]
            .columns
            .iter()
            .filter(|c| c.eq_ignore_ascii_case(column))
            .count();
        match hits {
            0 => Err(ResolutionError::UnknownColumn(qualified).into()),
            1 => Ok(ColumnKey::Relation(ColumnRef {
                relation,
                column: name,
            })),
            _ => Err(ResolutionError::AmbiguousColumn {
                candidates: format!("{hits} columns named `{column}` in `{qualifier}`"),
                column: qualified,
            }
            .into()),
        }
    }

    fn relation_by_alias(&self, scope: ScopeId, alias: &str) -> Option<RelationId> {
        self.scopes[scope.0]
            .relations
            .iter()
            .copied()
            .find(|r| self.relations[r.0].alias.eq_ignore_ascii_case(alias))
    }

    fn ancestors(&self, scope: ScopeId) -> Vec<ScopeId> {
        let mut out = Vec::new();
        let mut cur = self.scopes[scope.0].parent;
        while let Some(id) = cur {
            out.push(id);
            cur = self.scopes[id.0].parent;
        }
        out
    }

    fn qualified_names(&self, relations: &[RelationId], column: &str) -> String {
        relations
            .iter()
            .map(|r| format!("{}.{column}", self.relations[r.0].alias))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether values of `key` come, at any depth, from an opaque call.
    fn lineage(&self, key: &ColumnKey) -> bool {
        match key {
            ColumnKey::Relation(column) => match &self.relations[column.relation.0].source {
                RelationSource::Derived { scope } => self.scopes[scope.0]
                    .output(&column.column)
                    .is_some_and(|o| o.opaque_lineage),
                RelationSource::Base { .. } => false,
            },
            ColumnKey::Output { scope, name } => self.scopes[scope.0]
                .output(name)
                .is_some_and(|o| o.opaque_lineage),
        }
    }

    fn subtree_has_opaque(&self, scope: ScopeId) -> bool {
        self.calls.iter().any(|call| {
            let mut cur = Some(call.scope);
            while let Some(id) = cur {
                if id == scope {
                    return true;
                }
                cur = self.scopes[id.0].parent;
            }
            false
        })
    }

    fn plain_column(&self, scope: ScopeId, expr: &Expr) -> Option<ColumnRef> {
        let key = match expr {
            Expr::Nested(inner) => return self.plain_column(scope, inner),
            Expr::Identifier(ident) => self.resolve(scope, None, &ident.value, false),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [column] => self.resolve(scope, None, &column.value, false),
                [.., qualifier, column] => {
                    self.resolve(scope, Some(&qualifier.value), &column.value, false)
                }
                [] => return None,
            },
            _ => return None,
        };
        match key {
            Ok(ColumnKey::Relation(column)) => Some(column),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Null rejection
    // ------------------------------------------------------------------------

    /// True when an all-NULL row of `relation` can never satisfy `cond`.
    fn rejects_nulls(&self, scope: ScopeId, cond: &Expr, relation: RelationId) -> bool {
        match cond {
            Expr::Nested(inner) => self.rejects_nulls(scope, inner, relation),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.rejects_nulls(scope, left, relation) || self.rejects_nulls(scope, right, relation)
            }
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => {
                self.rejects_nulls(scope, left, relation) && self.rejects_nulls(scope, right, relation)
            }
            Expr::BinaryOp { left, op, right } if is_comparison(op) => {
                self.null_propagates(scope, left, relation)
                    || self.null_propagates(scope, right, relation)
            }
            Expr::InList { expr, .. }
            | Expr::InSubquery { expr, .. }
            | Expr::Between { expr, .. }
            | Expr::Like { expr, .. }
            | Expr::ILike { expr, .. }
            | Expr::IsNotNull(expr) => self.null_propagates(scope, expr, relation),
            _ => false,
        }
    }

    /// True when `expr` is NULL whenever the columns of `relation` are NULL.
    fn null_propagates(&self, scope: ScopeId, expr: &Expr, relation: RelationId) -> bool {
        match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => self
                .plain_column(scope, expr)
                .is_some_and(|column| column.relation == relation),
            Expr::Nested(inner) | Expr::Cast { expr: inner, .. } | Expr::UnaryOp { expr: inner, .. } => {
                self.null_propagates(scope, inner, relation)
            }
            Expr::BinaryOp { left, op, right } if is_arithmetic(op) => {
                self.null_propagates(scope, left, relation)
                    || self.null_propagates(scope, right, relation)
            }
            Expr::Function(function)
                if function.over.is_none()
                    && STRICT_FUNCTIONS.contains(&function_name(function).as_str()) =>
            {
                function.args.iter().any(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(arg))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(arg),
                        ..
                    } => self.null_propagates(scope, arg, relation),
                    _ => false,
                })
            }
            _ => false,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn true_expr() -> Expr {
    Expr::Value(Value::Boolean(true))
}

fn correlated_error(reference: &str) -> ModelError {
    ParseError::unsupported(format!(
        "correlated subquery (`{reference}` refers to an enclosing query)"
    ))
    .into()
}

pub(crate) fn function_name(function: &Function) -> String {
    function
        .name
        .0
        .last()
        .map(|ident| ident.value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn join_name(op: &JoinOperator) -> String {
    let name = match op {
        JoinOperator::RightOuter(_) => "RIGHT JOIN",
        JoinOperator::FullOuter(_) => "FULL JOIN",
        JoinOperator::LeftSemi(_) | JoinOperator::RightSemi(_) => "SEMI JOIN",
        JoinOperator::LeftAnti(_) | JoinOperator::RightAnti(_) => "ANTI JOIN",
        JoinOperator::CrossApply | JoinOperator::OuterApply => "APPLY",
        _ => "join operator",
    };
    format!("{name} (only INNER, LEFT and CROSS joins are analyzed)")
}

fn on_clause_mut(select: &mut Select, item: usize, join: usize) -> Option<&mut Expr> {
    let join = select.from.get_mut(item)?.joins.get_mut(join)?;
    match &mut join.join_operator {
        JoinOperator::Inner(JoinConstraint::On(expr))
        | JoinOperator::LeftOuter(JoinConstraint::On(expr)) => Some(expr),
        _ => None,
    }
}

fn default_output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

fn group_key_of_output(output: &OutputColumn) -> GroupKey {
    GroupKey {
        sql: output.sql.clone(),
        columns: output.sources.clone(),
        column: output.column.clone(),
        opaque_lineage: output.opaque_lineage,
    }
}

fn split_conjuncts(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(*left);
            out.extend(split_conjuncts(*right));
            out
        }
        Expr::Nested(inner)
            if matches!(
                inner.as_ref(),
                Expr::BinaryOp {
                    op: BinaryOperator::And,
                    ..
                }
            ) =>
        {
            split_conjuncts(*inner)
        }
        other => vec![other],
    }
}

fn join_conjuncts(conjuncts: Vec<Expr>) -> Option<Expr> {
    conjuncts.into_iter().reduce(|left, right| Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    })
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

fn is_arithmetic(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Plus
            | BinaryOperator::Minus
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo
            | BinaryOperator::StringConcat
    )
}

fn condition_kind(expr: &Expr, has_call: bool) -> ConditionKind {
    match expr {
        Expr::Nested(inner) => condition_kind(inner, has_call),
        Expr::BinaryOp {
            op: BinaryOperator::Or,
            ..
        } => ConditionKind::Disjunction,
        Expr::BinaryOp { op, .. } if is_comparison(op) => ConditionKind::Comparison,
        Expr::InList { .. } => ConditionKind::InList,
        Expr::InSubquery { .. } => ConditionKind::InSubquery,
        Expr::Exists { .. } => ConditionKind::Exists,
        Expr::Like { .. } | Expr::ILike { .. } => ConditionKind::Like,
        Expr::Between { .. } => ConditionKind::Between,
        Expr::IsNull(_) | Expr::IsNotNull(_) => ConditionKind::NullTest,
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            ..
        } => ConditionKind::Negation,
        Expr::Function(_) if has_call => ConditionKind::OpaqueCall,
        _ => ConditionKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::ast::Expr;

    fn parse_expr(sql: &str) -> Expr {
        let dialect = GenericDialect {};
        Parser::new(&dialect)
            .try_with_sql(sql)
            .expect("tokenize")
            .parse_expr()
            .expect("parse expr")
    }

    #[test]
    fn splits_nested_conjunctions_but_not_disjunctions() {
        let parts = split_conjuncts(parse_expr("a = 1 AND (b = 2 AND c = 3) AND (d = 4 OR e = 5)"));
        let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["a = 1", "b = 2", "c = 3", "(d = 4 OR e = 5)"]);
    }

    #[test]
    fn rejoins_conjuncts_in_order() {
        let parts = split_conjuncts(parse_expr("a = 1 AND (b = 2 OR c = 3)"));
        let joined = join_conjuncts(parts).expect("non-empty");
        assert_eq!(joined.to_string(), "a = 1 AND (b = 2 OR c = 3)");
        assert!(join_conjuncts(Vec::new()).is_none());
    }

    #[test]
    fn classifies_condition_shapes() {
        assert_eq!(condition_kind(&parse_expr("a = 1"), false), ConditionKind::Comparison);
        assert_eq!(condition_kind(&parse_expr("(a = 1 OR b = 2)"), false), ConditionKind::Disjunction);
        assert_eq!(condition_kind(&parse_expr("a IN (1, 2)"), false), ConditionKind::InList);
        assert_eq!(condition_kind(&parse_expr("a LIKE 'x%'"), false), ConditionKind::Like);
        assert_eq!(condition_kind(&parse_expr("a IS NULL"), false), ConditionKind::NullTest);
        assert_eq!(condition_kind(&parse_expr("NOT a"), false), ConditionKind::Negation);
        assert_eq!(condition_kind(&parse_expr("f(a)"), true), ConditionKind::OpaqueCall);
    }
}
