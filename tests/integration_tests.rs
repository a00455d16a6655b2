//! Integration tests for the complete qreduce pipeline
//!
//! These tests verify end-to-end behavior across crates:
//! - SQL text → QueryModel → Classification → ReductionPlan
//! - CandidateSets → reduced snapshots → baseline/reduced runs → verdict
//! - dataset loading (CSV directories and SQLite files)
//!
//! Run with: cargo test --test integration_tests

use proptest::prelude::*;
use qreduce_analyzer::{Analyzer, AnalyzerConfig, ReductionResult};
use qreduce_engine::{HostEngine, SqliteEngine};
use qreduce_query::OpaqueKind;
use tempfile::tempdir;

const SCHEMA: &str = "
    CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT, country TEXT);
    CREATE TABLE papers (id INTEGER PRIMARY KEY, author_id INTEGER, venue TEXT, year INTEGER, abstract TEXT);
    CREATE TABLE citations (citing INTEGER, cited INTEGER);
    INSERT INTO authors VALUES
        (1, 'Ada', 'UK'), (2, 'Brian', 'US'), (3, 'Chen', 'CN'),
        (4, 'Dana', 'US'), (5, 'Emil', 'DE'), (6, 'Fay', NULL);
    INSERT INTO papers VALUES
        (10, 1, 'VLDB', 2019, 'joins'), (11, 1, 'SIGMOD', 2021, 'llm operators'),
        (12, 2, 'VLDB', 2022, 'query rewriting'), (13, 3, 'ICDE', 2020, 'indexes'),
        (14, 4, 'SIGMOD', 2023, 'semi-joins'), (15, 4, 'VLDB', 2018, 'caching'),
        (16, 5, 'CIDR', 2022, 'streams'), (17, NULL, 'VLDB', 2021, 'anonymous'),
        (18, 2, 'ICDE', 2017, 'storage');
    INSERT INTO citations VALUES
        (11, 10), (12, 10), (12, 11), (14, 12), (14, 11), (16, 13),
        (15, 10), (18, 13), (17, 12), (13, 10);
";

fn analyzer() -> Analyzer<SqliteEngine> {
    let mut engine = SqliteEngine::open_in_memory().expect("open");
    engine.execute_batch(SCHEMA).expect("seed");
    Analyzer::new(engine, AnalyzerConfig::default()).expect("analyzer")
}

fn analyze(analyzer: &mut Analyzer<SqliteEngine>, sql: &str) -> ReductionResult {
    let result = analyzer.analyze_sql("q", sql).expect("analyze");
    assert!(result.is_equivalent(), "sql={sql}\nverdict={:?}", result.verdict);
    for relation in &result.relations {
        assert!(relation.reduced <= relation.original, "{relation:?}");
    }
    result
}

// ============================================================================
// Regression queries: every shape must verify equivalent
// ============================================================================

const REGRESSION: &[&str] = &[
    // plain join with a selective filter
    "SELECT a.name, llm_complete('m', 'summarize', p.abstract) AS s \
     FROM papers p JOIN authors a ON p.author_id = a.id WHERE a.country = 'US'",
    // IN subquery as a reducer
    "SELECT p.id FROM papers p \
     WHERE p.author_id IN (SELECT id FROM authors WHERE country = 'UK') \
     AND llm_filter('m', 'relevant?', p.abstract)",
    // uncorrelated EXISTS
    "SELECT p.id FROM papers p WHERE p.year > 2020 \
     AND EXISTS (SELECT 1 FROM citations WHERE cited = 10)",
    // left join, preserved side filtered locally
    "SELECT a.name, p.venue FROM authors a LEFT JOIN papers p ON p.author_id = a.id \
     WHERE a.country = 'US'",
    // left join with a null-rejecting WHERE on the nullable side
    "SELECT a.name, p.venue FROM authors a LEFT JOIN papers p ON p.author_id = a.id \
     WHERE p.year >= 2021",
    // two-hop citation chain
    "SELECT c1.citing, c2.cited FROM citations c1 JOIN citations c2 ON c1.cited = c2.citing \
     JOIN papers p ON c2.cited = p.id WHERE p.venue = 'VLDB'",
    // grouped with a monotone HAVING bound
    "SELECT a.country, count(*) AS n, llm_reduce('m', 'summarize', p.abstract) AS digest \
     FROM papers p JOIN authors a ON p.author_id = a.id \
     GROUP BY a.country HAVING count(*) >= 2",
    // derived table reducer
    "SELECT p.id, v.venue FROM papers p \
     JOIN (SELECT DISTINCT venue FROM papers WHERE year < 2019) AS v ON p.venue = v.venue",
    // disjunction across both relations
    "SELECT p.id FROM papers p JOIN authors a ON p.author_id = a.id \
     WHERE a.country = 'DE' OR p.venue = 'ICDE'",
    // ordered output
    "SELECT p.id FROM papers p JOIN authors a ON p.author_id = a.id \
     WHERE a.country = 'US' ORDER BY p.id",
    // rerank over a filtered input
    "SELECT p.id, llm_rerank('m', 'best first', p.abstract) AS r FROM papers p WHERE p.venue = 'SIGMOD'",
];

#[test]
fn test_regression_queries_are_equivalent() {
    let mut analyzer = analyzer();
    for sql in REGRESSION {
        analyze(&mut analyzer, sql);
    }
    assert!(analyzer.engine().live_snapshots().expect("list").is_empty());
}

#[test]
fn test_join_filter_reduces_both_sides() {
    let mut analyzer = analyzer();
    let result = analyze(&mut analyzer, REGRESSION[0]);
    // US authors: Brian, Dana. Their papers: 12, 14, 15, 18.
    let authors = result.relation("authors").expect("authors");
    assert_eq!((authors.original, authors.reduced), (6, 2));
    let papers = result.relation("papers").expect("papers");
    assert_eq!((papers.original, papers.reduced), (9, 4));

    let savings = result.opaque_savings.as_ref().expect("savings");
    assert_eq!(savings.kind, OpaqueKind::Transform);
    assert_eq!((savings.rows_before, savings.rows_after), (9, 4));
}

#[test]
fn test_null_join_keys_are_dropped() {
    let mut analyzer = analyzer();
    let sql = "SELECT a.name FROM papers p JOIN authors a ON p.author_id = a.id";
    let result = analyze(&mut analyzer, sql);
    // Paper 17 has no author; Fay has no papers.
    assert_eq!(result.relation("papers").expect("papers").reduced, 8);
    assert_eq!(result.relation("authors").expect("authors").reduced, 5);
}

#[test]
fn test_left_join_keeps_every_preserved_row() {
    let mut analyzer = analyzer();
    let result = analyze(
        &mut analyzer,
        "SELECT a.name, p.venue FROM authors a LEFT JOIN papers p ON p.author_id = a.id",
    );
    assert_eq!(result.relation("authors").expect("authors").reduced, 6);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_configured_opaque_function_is_stubbed() {
    let mut engine = SqliteEngine::open_in_memory().expect("open");
    engine.execute_batch(SCHEMA).expect("seed");
    let mut config = AnalyzerConfig::default();
    config
        .opaque_functions
        .insert("classify_topic".to_string(), OpaqueKind::Transform);
    let mut analyzer = Analyzer::new(engine, config).expect("analyzer");

    // Unregistered, SQLite would reject the unknown function at execution.
    let result = analyze(
        &mut analyzer,
        "SELECT p.id, classify_topic(p.abstract) AS topic FROM papers p WHERE p.year >= 2022",
    );
    // 2022 and later: papers 12, 14, 16.
    assert_eq!(result.relation("papers").expect("papers").reduced, 3);
    assert_eq!(
        result.opaque_savings.as_ref().expect("savings").function,
        "classify_topic"
    );
}

#[test]
fn test_sqlite_database_file_is_opened_read_only() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("papers.db");
    write_database(&path);

    let engine = SqliteEngine::open(&path).expect("open db");
    let mut analyzer = Analyzer::new(engine, AnalyzerConfig::default()).expect("analyzer");
    let result = analyze(&mut analyzer, REGRESSION[0]);
    assert_eq!(result.relation("papers").expect("papers").reduced, 4);
    // The source file is untouched by snapshots.
    assert_eq!(analyzer.engine_mut().cardinality("papers").expect("count"), 9);
}

#[test]
fn test_views_are_not_base_relations() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("papers.db");
    write_database(&path);
    let mut writer = SqliteEngine::open_in_memory().expect("open");
    writer
        .execute_batch(&format!(
            "ATTACH DATABASE '{}' AS target; \
             CREATE VIEW target.us_authors AS SELECT * FROM authors WHERE country = 'US'; \
             DETACH DATABASE target;",
            path.display().to_string().replace('\'', "''")
        ))
        .expect("create view");

    let engine = SqliteEngine::open(&path).expect("open db");
    let mut analyzer = Analyzer::new(engine, AnalyzerConfig::default()).expect("analyzer");
    assert!(analyzer.catalog().lookup("us_authors").is_none());

    let err = analyzer
        .analyze_sql("view", "SELECT u.name FROM us_authors u WHERE u.id > 1")
        .expect_err("views have no rowid to snapshot");
    assert_eq!(err.kind(), "resolution", "err={err}");
    assert!(analyzer.engine().live_snapshots().expect("list").is_empty());

    // Base tables of the same file still reduce.
    let result = analyze(&mut analyzer, REGRESSION[0]);
    assert_eq!(result.relation("authors").expect("authors").reduced, 2);
}

/// Write SCHEMA to a database file through an in-memory engine attached to it.
fn write_database(path: &std::path::Path) {
    let mut engine = SqliteEngine::open_in_memory().expect("open");
    let attach = format!(
        "ATTACH DATABASE '{}' AS target;",
        path.display().to_string().replace('\'', "''")
    );
    engine.execute_batch(&attach).expect("attach");
    let schema = SCHEMA
        .replace("CREATE TABLE ", "CREATE TABLE target.")
        .replace("INSERT INTO ", "INSERT INTO target.");
    engine.execute_batch(&schema).expect("seed file");
    engine.execute_batch("DETACH DATABASE target;").expect("detach");
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_random_year_filters_stay_equivalent(
        year in 2016i64..2025,
        min_papers in 1i64..4,
    ) {
        let mut analyzer = analyzer();
        let sql = format!(
            "SELECT a.country, count(*) AS n FROM papers p JOIN authors a ON p.author_id = a.id \
             WHERE p.year >= {year} GROUP BY a.country HAVING count(*) >= {min_papers}"
        );
        let result = analyzer.analyze_sql("prop", &sql).expect("analyze");
        prop_assert!(result.is_equivalent(), "sql={} verdict={:?}", sql, result.verdict);
        for relation in &result.relations {
            prop_assert!(relation.reduced <= relation.original);
        }
    }
}
