//! qreduce CLI
//!
//! Analyze SQL queries with embedded LLM operators against a dataset:
//! - compute the rows each relation can be reduced to before the opaque
//!   operator runs,
//! - run the opaque-free query over the original and the reduced tables,
//! - report the reduction and whether both runs agree.

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use qreduce_analyzer::{run_batch, Analyzer, AnalyzerConfig};
use qreduce_engine::SqliteEngine;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

mod report;

#[derive(Parser)]
#[command(name = "qreduce")]
#[command(
    author,
    version,
    about = "Shrink the input of LLM operators embedded in SQL, and prove the result unchanged"
)]
struct Cli {
    /// Query files, or directories searched recursively for `*.sql`
    #[arg(required = true)]
    queries: Vec<PathBuf>,

    /// Dataset: a directory of CSV files or a SQLite database file
    #[arg(short, long)]
    data: PathBuf,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Print the opaque-free and reduced SQL of every query
    #[arg(long)]
    show_queries: bool,

    /// Disable the HAVING-based group pre-pass
    #[arg(long)]
    no_group_prepass: bool,

    /// Upper bound on semi-join rounds per scope
    #[arg(long)]
    max_rounds: Option<usize>,

    /// Retries for transient engine failures
    #[arg(long)]
    retries: Option<u32>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", report::error_label());
            ExitCode::from(2)
        }
    }
}

/// Setup failures come back as `Err`; per-query outcomes only affect the code.
fn run(cli: &Cli) -> Result<u8> {
    let config = load_config(cli)?;
    let paths = collect_queries(&cli.queries)?;
    if paths.is_empty() {
        return Err(anyhow!("no .sql files found"));
    }

    let engine = SqliteEngine::open(&cli.data)
        .with_context(|| format!("failed to open dataset {}", cli.data.display()))?;
    let mut analyzer = Analyzer::new(engine, config).context("failed to read dataset catalog")?;
    info!(queries = paths.len(), "analyzing");

    let batch = run_batch(&mut analyzer, &paths);
    match cli.format {
        Format::Text => report::print_text(&batch, cli.show_queries),
        Format::Json => report::print_json(&batch)?,
    }
    Ok(if batch.exit_code() == 0 { 0 } else { 1 })
}

fn load_config(cli: &Cli) -> Result<AnalyzerConfig> {
    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::from_json_file(path)?,
        None => AnalyzerConfig::default(),
    };
    if cli.no_group_prepass {
        config.group_prepass = false;
    }
    if let Some(rounds) = cli.max_rounds {
        config.max_fixpoint_rounds = rounds;
    }
    if let Some(retries) = cli.retries {
        config.engine_retries = retries;
    }
    config.validate()?;
    Ok(config)
}

/// Files as given; directories walked for `*.sql`, each directory sorted.
fn collect_queries(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry.with_context(|| format!("failed to walk {}", input.display()))?;
                if entry.file_type().is_file() && is_sql(entry.path()) {
                    found.push(entry.into_path());
                }
            }
            found.sort();
            out.extend(found);
        } else if input.is_file() {
            out.push(input.clone());
        } else {
            return Err(anyhow!("query path {} does not exist", input.display()));
        }
    }
    Ok(out)
}

fn is_sql(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_are_walked_for_sql_files_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("nested")).expect("mkdir");
        std::fs::write(dir.path().join("b.sql"), "SELECT 1").expect("write");
        std::fs::write(dir.path().join("a.SQL"), "SELECT 1").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "x").expect("write");
        std::fs::write(dir.path().join("nested").join("c.sql"), "SELECT 1").expect("write");

        let found = collect_queries(&[dir.path().to_path_buf()]).expect("collect");
        let names: Vec<String> = found
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .expect("prefix")
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(names, vec!["a.SQL", "b.sql", "nested/c.sql"]);
    }

    #[test]
    fn missing_query_path_is_a_setup_error() {
        let err = collect_queries(&[PathBuf::from("/definitely/not/here.sql")])
            .expect_err("missing path");
        assert!(err.to_string().contains("does not exist"), "err={err}");
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "qreduce",
            "q.sql",
            "--data",
            "d",
            "--no-group-prepass",
            "--max-rounds",
            "3",
            "--retries",
            "0",
        ]);
        let config = load_config(&cli).expect("config");
        assert!(!config.group_prepass);
        assert_eq!(config.max_fixpoint_rounds, 3);
        assert_eq!(config.engine_retries, 0);
    }
}
