//! CSV datasets.
//!
//! Every `*.csv` file of a directory becomes one base relation named after
//! the file stem. Column types are inferred from the data: a column whose
//! non-empty cells all parse as integers is `INTEGER`, as numbers `REAL`,
//! anything else `TEXT`. Empty cells load as NULL.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rusqlite::{params_from_iter, Connection};
use tracing::{debug, info};

use crate::{quote_ident, EngineError, Value};

/// Summary of one loaded relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRelation {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn infer<'a>(cells: impl Iterator<Item = &'a str>) -> Self {
        let mut ty = ColumnType::Integer;
        for cell in cells.filter(|cell| !cell.is_empty()) {
            if ty == ColumnType::Integer && cell.parse::<i64>().is_err() {
                ty = ColumnType::Real;
            }
            if ty == ColumnType::Real && cell.parse::<f64>().is_err() {
                return ColumnType::Text;
            }
        }
        ty
    }

    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    fn value(self, cell: &str) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        match self {
            ColumnType::Integer => cell
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::from(cell)),
            ColumnType::Real => cell
                .parse::<f64>()
                .map(Value::Real)
                .unwrap_or_else(|_| Value::from(cell)),
            ColumnType::Text => Value::from(cell),
        }
    }
}

/// `*.csv` files of `dir`, sorted by path.
pub fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if path.is_file() && is_csv {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load every CSV file of `dir` into `conn`.
pub fn load_csv_dir(conn: &mut Connection, dir: &Path) -> Result<Vec<LoadedRelation>, EngineError> {
    let files = csv_files(dir)?;
    if files.is_empty() {
        return Err(EngineError::Dataset(format!(
            "no CSV files found in {}",
            dir.display()
        )));
    }

    let mut seen = BTreeSet::new();
    let mut loaded = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                EngineError::Dataset(format!("cannot derive a relation name from {}", path.display()))
            })?
            .to_string();
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(EngineError::Dataset(format!(
                "duplicate relation `{name}` (relation names are case-insensitive)"
            )));
        }
        loaded.push(load_csv_file(conn, &name, &path)?);
    }
    info!(relations = loaded.len(), dir = %dir.display(), "loaded CSV dataset");
    Ok(loaded)
}

/// Load one CSV file as relation `name`.
pub fn load_csv_file(
    conn: &mut Connection,
    name: &str,
    path: &Path,
) -> Result<LoadedRelation, EngineError> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let header = header.trim();
            if header.is_empty() {
                format!("column_{}", i + 1)
            } else {
                header.to_string()
            }
        })
        .collect();
    if columns.is_empty() {
        return Err(EngineError::Dataset(format!("{} has no header row", path.display())));
    }

    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record?);
    }

    let types: Vec<ColumnType> = (0..columns.len())
        .map(|i| ColumnType::infer(records.iter().map(|record| record.get(i).unwrap_or(""))))
        .collect();

    let column_defs = columns
        .iter()
        .zip(&types)
        .map(|(column, ty)| format!("{} {}", quote_ident(column), ty.sql()))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({column_defs})",
        quote_ident(name)
    ))?;

    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert = format!("INSERT INTO {} VALUES ({placeholders})", quote_ident(name));
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&insert)?;
        for record in &records {
            let values = types
                .iter()
                .enumerate()
                .map(|(i, ty)| ty.value(record.get(i).unwrap_or("")));
            stmt.execute(params_from_iter(values))?;
        }
    }
    tx.commit()?;

    debug!(relation = name, rows = records.len(), "loaded CSV relation");
    Ok(LoadedRelation {
        name: name.to_string(),
        columns,
        rows: records.len() as u64,
    })
}
