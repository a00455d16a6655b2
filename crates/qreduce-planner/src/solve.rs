//! Fixed-point evaluation of a [`ReductionPlan`] against the host engine.
//!
//! Each occurrence starts from its base table (or a snapshot of its derived
//! query) filtered by its local conditions. Semi-joins then replace a
//! candidate snapshot with a smaller one until a full round changes nothing.
//! A semi-join that does not shrink its target is discarded on the spot, so
//! the only snapshots left in the scratch guard are the current candidates.

use std::collections::BTreeMap;

use qreduce_engine::{quote_ident, EngineError, HostEngine, Predicate, Scratch, Source};
use qreduce_query::{QueryModel, RelationId, RelationSource};
use tracing::{debug, warn};

use crate::candidates::{CandidateSets, RelationCandidates};
use crate::plan::{GroupPrepass, ReductionPlan, RelationPlan, ScopePlan, SemiJoinEdge};
use crate::PlannerConfig;

const GROUPS_ALIAS: &str = "qr_groups";

/// Materialize candidate sets for every relation occurrence of `plan`.
pub fn solve<E: HostEngine + ?Sized>(
    model: &QueryModel,
    plan: &ReductionPlan,
    config: &PlannerConfig,
    scratch: &mut Scratch<'_, E>,
) -> Result<CandidateSets, EngineError> {
    let mut solver = Solver {
        model,
        config,
        scratch,
        sets: CandidateSets::default(),
    };
    for scope in &plan.scopes {
        solver.solve_scope(scope)?;
    }
    debug!(
        rounds = solver.sets.rounds,
        semi_joins = solver.sets.semi_joins,
        group_prepasses = solver.sets.group_prepasses,
        "solved reduction plan"
    );
    Ok(solver.sets)
}

struct Solver<'a, 's, 'e, E: HostEngine + ?Sized> {
    model: &'a QueryModel,
    config: &'a PlannerConfig,
    scratch: &'s mut Scratch<'e, E>,
    sets: CandidateSets,
}

impl<E: HostEngine + ?Sized> Solver<'_, '_, '_, E> {
    fn solve_scope(&mut self, plan: &ScopePlan) -> Result<(), EngineError> {
        for relation in &plan.relations {
            self.seed(relation)?;
        }

        // Most selective first; any order reaches the same fixed point.
        let mut order: Vec<RelationId> = plan.relations.iter().map(|r| r.relation).collect();
        order.sort_by(|a, b| self.selectivity(*a).total_cmp(&self.selectivity(*b)));

        self.fixpoint(plan, &order)?;
        if let Some(prepass) = &plan.prepass {
            if self.group_prepass(plan, prepass)? {
                self.fixpoint(plan, &order)?;
            }
        }
        Ok(())
    }

    fn seed(&mut self, plan: &RelationPlan) -> Result<(), EngineError> {
        let relation = self.model.relation(plan.relation);
        let alias = quote_ident(&relation.alias);
        let (table, original) = match &relation.source {
            RelationSource::Base { table } => (Some(table.clone()), table.clone()),
            RelationSource::Derived { scope } => {
                let sql = &self.model.scope(*scope).stubbed_sql;
                let snapshot = self
                    .scratch
                    .materialize(Source::Query(sql), &Predicate::all(alias.clone()))?;
                (None, snapshot)
            }
        };
        let original_rows = self.scratch.cardinality(&original)?;

        let (current, rows) = if plan.local_sql.is_empty() {
            (original.clone(), original_rows)
        } else {
            let predicate = Predicate::conjunction(alias, &plan.local_sql);
            let snapshot = self
                .scratch
                .materialize(Source::Relation(&original), &predicate)?;
            let rows = self.scratch.cardinality(&snapshot)?;
            (snapshot, rows)
        };
        debug!(
            relation = %relation.alias,
            original = original_rows,
            local = rows,
            "seeded candidates"
        );

        self.sets.relations.insert(
            plan.relation,
            RelationCandidates {
                relation: plan.relation,
                alias: relation.alias.clone(),
                table,
                original,
                original_rows,
                current,
                rows,
            },
        );
        Ok(())
    }

    fn fixpoint(&mut self, plan: &ScopePlan, order: &[RelationId]) -> Result<(), EngineError> {
        if plan.edges.is_empty() {
            return Ok(());
        }
        // Row counts only ever shrink, so an unchanged pair means the edge
        // cannot do anything new.
        let mut seen: BTreeMap<usize, (u64, u64)> = BTreeMap::new();
        for _ in 0..self.config.max_rounds {
            self.sets.rounds += 1;
            let mut changed = false;
            for target in order {
                for (i, edge) in plan.edges.iter().enumerate() {
                    if edge.target != *target {
                        continue;
                    }
                    let state = (self.rows(edge.target), self.rows(edge.reducer));
                    if seen.get(&i) == Some(&state) {
                        continue;
                    }
                    changed |= self.semi_join(edge)?;
                    seen.insert(i, (self.rows(edge.target), self.rows(edge.reducer)));
                }
            }
            if !changed {
                return Ok(());
            }
        }
        warn!(
            scope = %plan.scope,
            max_rounds = self.config.max_rounds,
            "semi-join round limit reached before the fixed point"
        );
        Ok(())
    }

    fn semi_join(&mut self, edge: &SemiJoinEdge) -> Result<bool, EngineError> {
        let target = self.sets.get(edge.target);
        let reducer = self.sets.get(edge.reducer);
        let (Some(target), Some(reducer)) = (target, reducer) else {
            return Ok(false);
        };
        let filter = format!(
            "EXISTS (SELECT 1 FROM {} AS {} WHERE {})",
            quote_ident(&reducer.current),
            quote_ident(&reducer.alias),
            edge.sql
        );
        let source = target.current.clone();
        let predicate = Predicate::new(quote_ident(&target.alias), filter);
        self.shrink(edge.target, &source, &predicate)
    }

    /// Materialize `predicate` over `source`; keep the result only when it
    /// has fewer rows than the current candidates of `relation`.
    fn shrink(
        &mut self,
        relation: RelationId,
        source: &str,
        predicate: &Predicate,
    ) -> Result<bool, EngineError> {
        let snapshot = self
            .scratch
            .materialize(Source::Relation(source), predicate)?;
        let rows = self.scratch.cardinality(&snapshot)?;
        self.sets.semi_joins += 1;

        let Some(entry) = self.sets.relations.get_mut(&relation) else {
            self.scratch.release(&snapshot)?;
            return Ok(false);
        };
        if rows >= entry.rows {
            self.scratch.release(&snapshot)?;
            return Ok(false);
        }
        debug!(relation = %entry.alias, from = entry.rows, to = rows, "candidates shrank");
        let previous = std::mem::replace(&mut entry.current, snapshot);
        entry.rows = rows;
        if previous != entry.original {
            self.scratch.release(&previous)?;
        }
        Ok(true)
    }

    fn group_prepass(
        &mut self,
        plan: &ScopePlan,
        prepass: &GroupPrepass,
    ) -> Result<bool, EngineError> {
        let mut from = Vec::new();
        for relation in &plan.relations {
            let Some(candidates) = self.sets.get(relation.relation) else {
                return Ok(false);
            };
            from.push(format!(
                "{} AS {}",
                quote_ident(&candidates.current),
                quote_ident(&candidates.alias)
            ));
        }
        let keys: Vec<String> = prepass
            .keys
            .iter()
            .enumerate()
            .map(|(i, key)| format!("{key} AS k{i}"))
            .collect();
        let mut sql = format!("SELECT {} FROM {}", keys.join(", "), from.join(", "));
        if !prepass.joins.is_empty() {
            sql.push_str(&format!(" WHERE {}", parenthesized(&prepass.joins)));
        }
        sql.push_str(&format!(
            " GROUP BY {} HAVING {}",
            prepass.keys.join(", "),
            parenthesized(&prepass.having)
        ));

        let groups = self
            .scratch
            .materialize(Source::Query(&sql), &Predicate::all(GROUPS_ALIAS))?;
        self.sets.group_prepasses += 1;
        let qualifying = self.scratch.cardinality(&groups)?;
        debug!(scope = %plan.scope, groups = qualifying, "group pre-pass");

        let mut shrank = false;
        for (relation, columns) in &prepass.owners {
            let Some(candidates) = self.sets.get(*relation) else {
                continue;
            };
            let alias = quote_ident(&candidates.alias);
            let matches: Vec<String> = columns
                .iter()
                .map(|(i, column)| {
                    format!("{GROUPS_ALIAS}.k{i} IS {alias}.{}", quote_ident(column))
                })
                .collect();
            let filter = format!(
                "EXISTS (SELECT 1 FROM {} AS {GROUPS_ALIAS} WHERE {})",
                quote_ident(&groups),
                matches.join(" AND ")
            );
            let source = candidates.current.clone();
            shrank |= self.shrink(*relation, &source, &Predicate::new(alias, filter))?;
        }
        self.scratch.release(&groups)?;
        Ok(shrank)
    }

    fn rows(&self, relation: RelationId) -> u64 {
        self.sets.get(relation).map_or(0, |c| c.rows)
    }

    fn selectivity(&self, relation: RelationId) -> f64 {
        match self.sets.get(relation) {
            Some(c) if c.original_rows > 0 => c.rows as f64 / c.original_rows as f64,
            _ => 0.0,
        }
    }
}

fn parenthesized(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| format!("({part})"))
        .collect::<Vec<_>>()
        .join(" AND ")
}
