//! SQLite host engine.
//!
//! Base relations live in the `main` schema: either an in-memory database
//! filled from a CSV directory, or a database file opened read-only.
//! Snapshots are `TEMP` tables named `qr_<n>`; they are private to the
//! connection and disappear with it.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, info};

use crate::dataset::{self, LoadedRelation};
use crate::{quote_ident, EngineError, HostEngine, Predicate, RowSet, Source, Value};

pub struct SqliteEngine {
    conn: Connection,
    next_snapshot: u64,
    snapshots: BTreeSet<String>,
}

impl SqliteEngine {
    fn with_connection(conn: Connection) -> Result<Self, EngineError> {
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(Self {
            conn,
            next_snapshot: 0,
            snapshots: BTreeSet::new(),
        })
    }

    /// Empty in-memory database.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Open a dataset location: a directory of CSV files or a SQLite file.
    pub fn open(location: &Path) -> Result<Self, EngineError> {
        if location.is_dir() {
            Self::open_csv_dir(location)
        } else if location.is_file() {
            Self::open_database(location)
        } else {
            Err(EngineError::Dataset(format!(
                "dataset location {} does not exist",
                location.display()
            )))
        }
    }

    /// In-memory database holding every CSV file of `dir`.
    pub fn open_csv_dir(dir: &Path) -> Result<Self, EngineError> {
        let mut engine = Self::open_in_memory()?;
        dataset::load_csv_dir(&mut engine.conn, dir)?;
        Ok(engine)
    }

    /// Existing SQLite database, opened read-only.
    pub fn open_database(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        info!(path = %path.display(), "opened SQLite dataset read-only");
        Self::with_connection(conn)
    }

    /// Load one more CSV file as a base relation.
    pub fn load_csv(&mut self, name: &str, path: &Path) -> Result<LoadedRelation, EngineError> {
        dataset::load_csv_file(&mut self.conn, name, path)
    }

    /// Run setup statements (DDL, inserts) against the base schema.
    pub fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Tables currently present in the TEMP schema.
    pub fn live_snapshots(&self) -> Result<Vec<String>, EngineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM temp.sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn next_name(&mut self) -> String {
        self.next_snapshot += 1;
        format!("qr_{}", self.next_snapshot)
    }
}

impl HostEngine for SqliteEngine {
    fn execute(&mut self, sql: &str, bindings: &[Value]) -> Result<RowSet, EngineError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = stmt.query(params_from_iter(bindings.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(Value::from(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(RowSet { columns, rows: out })
    }

    fn materialize(
        &mut self,
        source: Source<'_>,
        predicate: &Predicate,
    ) -> Result<String, EngineError> {
        let name = self.next_name();
        let target = format!("temp.{}", quote_ident(&name));
        let alias = &predicate.alias;
        let filter = predicate
            .sql
            .as_deref()
            .map(|sql| format!(" WHERE {sql}"))
            .unwrap_or_default();

        match source {
            Source::Relation(relation) => {
                let columns = self.columns(relation)?;
                let from = quote_ident(relation);
                self.conn
                    .execute_batch(&format!("CREATE TABLE {target} AS SELECT * FROM {from} WHERE 0"))?;
                let column_list = columns
                    .iter()
                    .map(|column| quote_ident(column))
                    .collect::<Vec<_>>()
                    .join(", ");
                let insert = format!(
                    "INSERT INTO {target} (rowid, {column_list}) \
                     SELECT {alias}.rowid, {alias}.* FROM {from} AS {alias}{filter}"
                );
                if let Err(err) = self.conn.execute(&insert, []) {
                    let _ = self.conn.execute_batch(&format!("DROP TABLE IF EXISTS {target}"));
                    return Err(err.into());
                }
            }
            Source::Query(sql) => {
                self.conn.execute_batch(&format!(
                    "CREATE TABLE {target} AS SELECT * FROM ({sql}) AS {alias}{filter}"
                ))?;
            }
        }

        debug!(snapshot = %name, ?source, "materialized snapshot");
        self.snapshots.insert(name.clone());
        Ok(name)
    }

    fn reset(&mut self, relation: &str) -> Result<(), EngineError> {
        if !self.snapshots.remove(relation) {
            return Ok(());
        }
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS temp.{}", quote_ident(relation)))?;
        Ok(())
    }

    /// Tables with rowids only: snapshots key on `rowid`, which views and
    /// WITHOUT ROWID tables lack.
    fn relations(&mut self) -> Result<Vec<String>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM main.sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
             AND coalesce(sql, '') NOT LIKE '%WITHOUT ROWID%' \
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn columns(&mut self, relation: &str) -> Result<Vec<String>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(relation)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(EngineError::UnknownRelation(relation.to_string()));
        }
        Ok(columns)
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Real(v),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SqliteEngine {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        engine
            .execute_batch(
                "CREATE TABLE nodes (id INTEGER, country TEXT);
                 INSERT INTO nodes VALUES (1, 'CA'), (2, 'US'), (3, 'CA'), (4, NULL);",
            )
            .expect("seed");
        engine
    }

    #[test]
    fn materialize_keeps_row_ids() {
        let mut engine = engine();
        let snapshot = engine
            .materialize(
                Source::Relation("nodes"),
                &Predicate::new("n", "n.country = 'CA'"),
            )
            .expect("materialize");
        let rows = engine
            .execute(&format!("SELECT rowid, id FROM {snapshot} ORDER BY rowid"), &[])
            .expect("query snapshot");
        assert_eq!(
            rows.rows,
            vec![
                vec![Value::Integer(1), Value::Integer(1)],
                vec![Value::Integer(3), Value::Integer(3)],
            ]
        );

        // A snapshot of a snapshot still points at the base row ids.
        let nested = engine
            .materialize(Source::Relation(&snapshot), &Predicate::new("m", "m.id > 1"))
            .expect("materialize nested");
        let rows = engine
            .execute(&format!("SELECT rowid FROM {nested}"), &[])
            .expect("query nested");
        assert_eq!(rows.rows, vec![vec![Value::Integer(3)]]);
    }

    #[test]
    fn reset_drops_only_snapshots() {
        let mut engine = engine();
        let snapshot = engine
            .materialize(Source::Relation("nodes"), &Predicate::all("n"))
            .expect("materialize");
        assert_eq!(engine.live_snapshots().expect("list"), vec![snapshot.clone()]);

        engine.reset(&snapshot).expect("reset snapshot");
        engine.reset("nodes").expect("base reset is a no-op");
        assert!(engine.live_snapshots().expect("list").is_empty());
        assert_eq!(engine.cardinality("nodes").expect("count"), 4);
    }

    #[test]
    fn failed_materialize_leaves_no_table() {
        let mut engine = engine();
        let err = engine
            .materialize(
                Source::Relation("nodes"),
                &Predicate::new("n", "n.no_such_column = 1"),
            )
            .expect_err("bad predicate");
        assert!(err.to_string().contains("no_such_column"), "err={err}");
        assert!(engine.live_snapshots().expect("list").is_empty());
    }

    #[test]
    fn materialize_from_query() {
        let mut engine = engine();
        let snapshot = engine
            .materialize(
                Source::Query("SELECT country, count(*) AS n FROM nodes GROUP BY country"),
                &Predicate::new("g", "g.n > 1"),
            )
            .expect("materialize");
        assert_eq!(engine.columns(&snapshot).expect("columns"), vec!["country", "n"]);
        assert_eq!(engine.cardinality(&snapshot).expect("count"), 1);
    }

    #[test]
    fn execute_binds_parameters() {
        let mut engine = engine();
        let rows = engine
            .execute(
                "SELECT id FROM nodes WHERE country = ? ORDER BY id",
                &[Value::from("CA")],
            )
            .expect("query");
        assert_eq!(rows.columns, vec!["id"]);
        assert_eq!(rows.rows, vec![vec![Value::Integer(1)], vec![Value::Integer(3)]]);
    }

    #[test]
    fn catalog_helpers() {
        let mut engine = engine();
        assert_eq!(engine.relations().expect("relations"), vec!["nodes"]);
        assert_eq!(engine.columns("nodes").expect("columns"), vec!["id", "country"]);
        let err = engine.columns("missing").expect_err("unknown");
        assert!(matches!(err, EngineError::UnknownRelation(_)));
    }

    #[test]
    fn relations_without_rowids_are_not_listed() {
        let mut engine = engine();
        engine
            .execute_batch(
                "CREATE VIEW ca AS SELECT * FROM nodes WHERE country = 'CA';
                 CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (a, b)) WITHOUT ROWID;",
            )
            .expect("seed");
        assert_eq!(engine.relations().expect("relations"), vec!["nodes"]);
    }
}
