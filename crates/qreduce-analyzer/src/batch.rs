//! Batches of query files.
//!
//! Queries run one after another against the same engine. A failing query
//! is recorded and the batch moves on.

use std::path::{Path, PathBuf};

use qreduce_engine::HostEngine;
use serde::Serialize;
use tracing::{error, info};

use crate::analyzer::Analyzer;
use crate::error::AnalysisError;
use crate::result::ReductionResult;

#[derive(Debug)]
pub struct BatchItem {
    pub name: String,
    pub outcome: Result<ReductionResult, AnalysisError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub equivalent: usize,
    pub diverged: usize,
    pub failed: usize,
    pub rows_avoided: u64,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.equivalent + self.diverged + self.failed
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for item in &self.items {
            match &item.outcome {
                Ok(result) if result.is_equivalent() => {
                    summary.equivalent += 1;
                    summary.rows_avoided += result.rows_avoided();
                }
                Ok(_) => summary.diverged += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// 0 when every query verified equivalent, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        let summary = self.summary();
        if summary.diverged == 0 && summary.failed == 0 {
            0
        } else {
            1
        }
    }
}

pub fn run_batch<E: HostEngine>(analyzer: &mut Analyzer<E>, paths: &[PathBuf]) -> BatchReport {
    let mut report = BatchReport::default();
    for path in paths {
        let outcome = analyzer.analyze_file(path);
        if let Err(err) = &outcome {
            error!(query = %path.display(), kind = err.kind(), "{err}");
        }
        report.items.push(BatchItem {
            name: query_name(path),
            outcome,
        });
    }
    let summary = report.summary();
    info!(
        equivalent = summary.equivalent,
        diverged = summary.diverged,
        failed = summary.failed,
        "batch finished"
    );
    report
}

fn query_name(path: &Path) -> String {
    path.display().to_string()
}
