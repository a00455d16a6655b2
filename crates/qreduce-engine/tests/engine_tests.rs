//! Dataset loading and scratch ownership against the SQLite engine.

use std::fs;
use std::time::Duration;

use qreduce_engine::{
    EngineError, HostEngine, Predicate, RetryPolicy, Scratch, Source, SqliteEngine, Value,
};

fn write_dataset(dir: &std::path::Path) {
    fs::write(
        dir.join("nodes.csv"),
        "id,country,label,score\n1,CA,alpha,1.5\n2,US,beta,\n3,CA,,2\n",
    )
    .expect("write nodes");
    fs::write(dir.join("edges.csv"), "src,dst\n1,2\n2,3\n3,1\n").expect("write edges");
    fs::write(dir.join("README.txt"), "not a relation").expect("write readme");
}

#[test]
fn loads_every_csv_file_as_a_relation() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_dataset(dir.path());

    let mut engine = SqliteEngine::open(dir.path()).expect("open dataset");
    assert_eq!(engine.relations().expect("relations"), vec!["edges", "nodes"]);
    assert_eq!(
        engine.columns("nodes").expect("columns"),
        vec!["id", "country", "label", "score"]
    );
    assert_eq!(engine.cardinality("edges").expect("count"), 3);

    let rows = engine
        .execute(
            "SELECT typeof(id), typeof(score), label FROM nodes ORDER BY id",
            &[],
        )
        .expect("query");
    assert_eq!(
        rows.rows,
        vec![
            vec![Value::from("integer"), Value::from("real"), Value::from("alpha")],
            vec![Value::from("integer"), Value::from("null"), Value::from("beta")],
            vec![Value::from("integer"), Value::from("real"), Value::Null],
        ]
    );
}

#[test]
fn empty_directory_is_a_dataset_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = SqliteEngine::open(dir.path()).err().expect("no csv files");
    assert!(matches!(err, EngineError::Dataset(_)), "err={err}");
}

#[test]
fn missing_location_is_a_dataset_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = SqliteEngine::open(&dir.path().join("nope"))
        .err()
        .expect("missing");
    assert!(err.to_string().contains("does not exist"), "err={err}");
}

#[test]
fn database_file_opens_read_only_but_allows_snapshots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("data.db");
    create_database_file(&path);

    let mut engine = SqliteEngine::open(&path).expect("open db");
    let err = engine
        .execute_batch("INSERT INTO nodes VALUES (9, 'FR')")
        .expect_err("read-only");
    assert!(err.to_string().to_lowercase().contains("readonly"), "err={err}");

    let snapshot = engine
        .materialize(Source::Relation("nodes"), &Predicate::new("n", "n.id = 1"))
        .expect("temp tables are writable");
    assert_eq!(engine.cardinality(&snapshot).expect("count"), 1);
}

/// Write a small database file through an attached writable connection.
fn create_database_file(path: &std::path::Path) {
    let mut engine = SqliteEngine::open_in_memory().expect("open");
    engine
        .execute_batch(&format!(
            "ATTACH DATABASE '{}' AS disk;
             CREATE TABLE disk.nodes (id INTEGER, country TEXT);
             INSERT INTO disk.nodes VALUES (1, 'CA'), (2, 'US');
             DETACH DATABASE disk;",
            path.display()
        ))
        .expect("create db file");
}

#[test]
fn scratch_releases_on_drop() {
    let mut engine = SqliteEngine::open_in_memory().expect("open");
    engine
        .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2), (3);")
        .expect("seed");

    {
        let mut scratch = Scratch::new(&mut engine, RetryPolicy::none());
        let a = scratch
            .materialize(Source::Relation("t"), &Predicate::new("t", "t.x > 1"))
            .expect("a");
        let b = scratch
            .materialize(Source::Relation(&a), &Predicate::new("t", "t.x > 2"))
            .expect("b");
        assert_eq!(scratch.cardinality(&b).expect("count"), 1);
        assert_eq!(scratch.owned().len(), 2);

        scratch.release(&a).expect("release early");
        assert!(!scratch.owns(&a));
        assert!(scratch.owns(&b));
    }

    assert!(engine.live_snapshots().expect("list").is_empty());
    assert_eq!(engine.cardinality("t").expect("base untouched"), 3);
}

#[test]
fn scratch_releases_on_error_path() {
    fn failing(engine: &mut SqliteEngine) -> Result<(), EngineError> {
        let mut scratch = Scratch::new(engine, RetryPolicy::none());
        scratch.materialize(Source::Relation("t"), &Predicate::all("t"))?;
        scratch.materialize(Source::Relation("t"), &Predicate::new("t", "t.missing = 1"))?;
        Ok(())
    }

    let mut engine = SqliteEngine::open_in_memory().expect("open");
    engine
        .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
        .expect("seed");
    assert!(failing(&mut engine).is_err());
    assert!(engine.live_snapshots().expect("list").is_empty());
}

/// Engine that reports `busy` a fixed number of times before delegating.
struct Flaky {
    inner: SqliteEngine,
    failures_left: u32,
}

impl HostEngine for Flaky {
    fn execute(&mut self, sql: &str, bindings: &[Value]) -> Result<qreduce_engine::RowSet, EngineError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(EngineError::transient("database is busy"));
        }
        self.inner.execute(sql, bindings)
    }

    fn materialize(&mut self, source: Source<'_>, predicate: &Predicate) -> Result<String, EngineError> {
        self.inner.materialize(source, predicate)
    }

    fn reset(&mut self, relation: &str) -> Result<(), EngineError> {
        self.inner.reset(relation)
    }

    fn relations(&mut self) -> Result<Vec<String>, EngineError> {
        self.inner.relations()
    }

    fn columns(&mut self, relation: &str) -> Result<Vec<String>, EngineError> {
        self.inner.columns(relation)
    }
}

#[test]
fn scratch_retries_transient_failures() {
    let mut inner = SqliteEngine::open_in_memory().expect("open");
    inner
        .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
        .expect("seed");
    let mut flaky = Flaky {
        inner,
        failures_left: 2,
    };
    let policy = RetryPolicy {
        retries: 2,
        backoff: Duration::ZERO,
    };
    let mut scratch = Scratch::new(&mut flaky, policy);
    let rows = scratch.execute("SELECT x FROM t", &[]).expect("retried");
    assert_eq!(rows.len(), 1);
}
