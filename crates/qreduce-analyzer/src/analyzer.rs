//! Per-query pipeline: parse, classify, plan, solve, materialize, run twice,
//! verify.

use std::fs;
use std::path::Path;
use std::time::Instant;

use qreduce_engine::{EngineError, HostEngine, Scratch};
use qreduce_planner::{plan, solve};
use qreduce_query::{build_model, classify, stubbed_sql, Catalog, OpaqueRegistry};
use tracing::{debug, info, info_span, warn};

use crate::config::AnalyzerConfig;
use crate::error::AnalysisError;
use crate::harness;
use crate::metrics::{opaque_savings, RelationReduction};
use crate::result::{OpaqueCondition, ReductionResult, SolveStats, Timing, UnreducedRelation};
use crate::verify::{self, Verdict};

pub struct Analyzer<E: HostEngine> {
    engine: E,
    config: AnalyzerConfig,
    catalog: Catalog,
    registry: OpaqueRegistry,
}

impl<E: HostEngine> Analyzer<E> {
    /// Wrap `engine`, reading its base relations into the catalog.
    pub fn new(mut engine: E, config: AnalyzerConfig) -> Result<Self, EngineError> {
        let mut catalog = Catalog::new();
        for name in engine.relations()? {
            let columns = engine.columns(&name)?;
            catalog.insert(name, columns);
        }
        info!(relations = catalog.len(), "catalog loaded");
        let registry = config.registry();
        Ok(Self {
            engine,
            config,
            catalog,
            registry,
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn analyze_file(&mut self, path: &Path) -> Result<ReductionResult, AnalysisError> {
        let text = fs::read_to_string(path).map_err(|source| AnalysisError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.analyze_sql(&path.display().to_string(), &text)
    }

    pub fn analyze_sql(&mut self, name: &str, text: &str) -> Result<ReductionResult, AnalysisError> {
        let span = info_span!("query", name = %name);
        let _enter = span.enter();
        let started = Instant::now();

        let model = build_model(text, &self.catalog, &self.registry)?;
        let classification = classify(&model);
        let opaque_conditions: Vec<OpaqueCondition> = classification
            .opaque()
            .map(|(id, reason)| OpaqueCondition {
                sql: model.condition(id).sql.clone(),
                reason: reason.to_string(),
            })
            .collect();
        for condition in &opaque_conditions {
            debug!(condition = %condition.sql, reason = %condition.reason, "opaque-dependent");
        }
        let planner = self.config.planner();
        let plan = plan(&model, &classification, &planner);
        let unreduced: Vec<UnreducedRelation> = plan
            .unreduced()
            .map(|(id, reason)| UnreducedRelation {
                alias: model.relation(id).alias.clone(),
                reason: reason.to_string(),
            })
            .collect();
        let model_done = Instant::now();

        // Every snapshot below belongs to this guard and is dropped with it,
        // whichever way this block is left.
        let mut scratch = Scratch::new(&mut self.engine, self.config.retry());
        let candidates = solve(&model, &plan, &planner, &mut scratch)?;
        let reduced = harness::materialize_reduced(&mut scratch, &candidates)?;
        let solve_done = Instant::now();

        let baseline = harness::baseline_rows(&mut scratch, &model)?;
        let reduced_rows = harness::reduced_rows(&mut scratch, &model, &reduced)?;
        drop(scratch);
        let verdict = verify::compare(&baseline, &reduced_rows, self.config.max_reported_tuples);
        let finished = Instant::now();

        let relations: Vec<RelationReduction> =
            reduced.values().map(RelationReduction::from).collect();
        match &verdict {
            Verdict::Equivalent => info!(
                relations = relations.len(),
                rows_avoided = relations.iter().map(|r| r.rows_avoided()).sum::<u64>(),
                "equivalent"
            ),
            Verdict::Diverged(divergence) => warn!(
                missing = divergence.missing,
                unexpected = divergence.unexpected,
                "reduced query diverged from the baseline"
            ),
        }

        let ms = |from: Instant, to: Instant| to.duration_since(from).as_secs_f64() * 1000.0;
        Ok(ReductionResult {
            query: name.to_string(),
            sql: text.trim().to_string(),
            stubbed_sql: stubbed_sql(&model),
            reduced_sql: harness::reduced_sql(&model, &reduced),
            relations,
            opaque_savings: opaque_savings(&model, &candidates),
            opaque_conditions,
            unreduced,
            baseline_rows: baseline.len(),
            reduced_rows: reduced_rows.len(),
            stats: SolveStats {
                rounds: candidates.rounds,
                semi_joins: candidates.semi_joins,
                group_prepasses: candidates.group_prepasses,
            },
            timing: Timing {
                model_ms: ms(started, model_done),
                solve_ms: ms(model_done, solve_done),
                verify_ms: ms(solve_done, finished),
                total_ms: ms(started, finished),
            },
            verdict,
        })
    }
}
