//! Text and JSON rendering of batch reports.

use anyhow::Result;
use colored::{ColoredString, Colorize};
use qreduce_analyzer::{
    AnalysisError, BatchReport, BatchSummary, Divergence, ReductionResult, RelationReduction,
    TupleCount, Verdict,
};
use serde::Serialize;

pub fn error_label() -> ColoredString {
    "error:".red().bold()
}

// ============================================================================
// Text
// ============================================================================

pub fn print_text(batch: &BatchReport, show_queries: bool) {
    for item in &batch.items {
        match &item.outcome {
            Ok(result) => print_result(&item.name, result, show_queries),
            Err(err) => print_failure(&item.name, err),
        }
    }
    print_summary(&batch.summary());
}

fn print_result(name: &str, result: &ReductionResult, show_queries: bool) {
    let status = match &result.verdict {
        Verdict::Equivalent => "ok".green().bold(),
        Verdict::Diverged(_) => "DIVERGED".red().bold(),
    };
    println!(
        "{status} {} {}",
        name.bold(),
        format!(
            "({} → {} result rows, {:.1} ms)",
            result.baseline_rows, result.reduced_rows, result.timing.total_ms
        )
        .dimmed()
    );

    for relation in &result.relations {
        print_reduction("→".cyan(), relation.relation.normal(), relation);
    }
    if !result.relations.is_empty() {
        print_reduction("=".cyan(), "OVERALL".bold(), &result.overall());
    }
    if let Some(savings) = &result.opaque_savings {
        println!(
            "  {} {} ({}, {}) over [{}]: {} → {} rows",
            "→".yellow(),
            savings.function.bold(),
            savings.kind,
            savings.site,
            savings.relations.join(", "),
            savings.rows_before,
            savings.rows_after
        );
    }
    for condition in &result.opaque_conditions {
        println!(
            "  {} skipped `{}` ({})",
            "info:".yellow().bold(),
            condition.sql,
            condition.reason
        );
    }
    for relation in &result.unreduced {
        println!(
            "  {} `{}` not reduced: {}",
            "info:".yellow().bold(),
            relation.alias,
            relation.reason
        );
    }
    if let Verdict::Diverged(divergence) = &result.verdict {
        print_divergence(divergence);
    }
    if let Err(err) = result.ensure_equivalent() {
        println!("  {} {err}", error_label());
    }
    if show_queries {
        println!("  {} {}", "stubbed:".cyan(), result.stubbed_sql);
        println!("  {} {}", "reduced:".cyan(), result.reduced_sql);
    }
}

fn print_reduction(marker: ColoredString, label: ColoredString, reduction: &RelationReduction) {
    println!(
        "  {marker} {:<24} {:>8} → {:<8} {}",
        label,
        reduction.original,
        reduction.reduced,
        format!("{:.1}% fewer rows", reduction.ratio * 100.0).dimmed()
    );
}

fn print_divergence(divergence: &Divergence) {
    if let Some((baseline, reduced)) = &divergence.columns {
        println!(
            "  {} columns differ: [{}] vs [{}]",
            "→".red(),
            baseline.join(", "),
            reduced.join(", ")
        );
    }
    println!(
        "  {} {} tuple(s) missing, {} unexpected",
        "→".red(),
        divergence.missing,
        divergence.unexpected
    );
    for tuple in &divergence.only_in_baseline {
        println!("    {} {}", "-".red(), tuple_text(tuple));
    }
    for tuple in &divergence.only_in_reduced {
        println!("    {} {}", "+".green(), tuple_text(tuple));
    }
    if divergence.truncated {
        println!("    {}", "(more tuples not shown)".dimmed());
    }
}

fn tuple_text(tuple: &TupleCount) -> String {
    let values = tuple
        .values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if tuple.count == 1 {
        format!("({values})")
    } else {
        format!("({values}) x{}", tuple.count)
    }
}

fn print_failure(name: &str, err: &AnalysisError) {
    println!("{} {} [{}] {err}", "failed".red().bold(), name.bold(), err.kind());
}

fn print_summary(summary: &BatchSummary) {
    let diverged = format!("{} diverged", summary.diverged);
    let failed = format!("{} failed", summary.failed);
    println!(
        "\n{} {} queries: {} equivalent, {}, {}; {} rows avoided",
        "summary".bold(),
        summary.total(),
        summary.equivalent.to_string().green(),
        if summary.diverged > 0 { diverged.red() } else { diverged.normal() },
        if summary.failed > 0 { failed.red() } else { failed.normal() },
        summary.rows_avoided
    );
}

// ============================================================================
// JSON
// ============================================================================

#[derive(Serialize)]
struct JsonReport<'a> {
    summary: BatchSummary,
    queries: Vec<JsonQuery<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum JsonQuery<'a> {
    Analyzed {
        name: &'a str,
        overall: RelationReduction,
        result: &'a ReductionResult,
    },
    Failed {
        name: &'a str,
        kind: &'static str,
        message: String,
    },
}

pub fn print_json(batch: &BatchReport) -> Result<()> {
    let queries = batch
        .items
        .iter()
        .map(|item| match &item.outcome {
            Ok(result) => JsonQuery::Analyzed {
                name: &item.name,
                overall: result.overall(),
                result,
            },
            Err(err) => JsonQuery::Failed {
                name: &item.name,
                kind: err.kind(),
                message: err.to_string(),
            },
        })
        .collect();
    let report = JsonReport {
        summary: batch.summary(),
        queries,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
