//! Equivalence of the baseline and reduced results.
//!
//! Both results are compared as unordered multisets of rows. The verdict is
//! `Equivalent` iff the symmetric difference is empty; ORDER BY is not
//! checked (ties may come back in a different order from smaller inputs).

use std::collections::BTreeMap;

use qreduce_engine::{RowSet, Value};
use serde::Serialize;

/// One distinct row and how many more times it occurs on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TupleCount {
    pub values: Vec<Value>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    /// Set when the two runs disagree on output columns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<(Vec<String>, Vec<String>)>,
    pub only_in_baseline: Vec<TupleCount>,
    pub only_in_reduced: Vec<TupleCount>,
    /// Total multiplicity missing from the reduced result.
    pub missing: usize,
    /// Total multiplicity the reduced result has in excess.
    pub unexpected: usize,
    /// The tuple lists were cut at the configured limit.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Equivalent,
    Diverged(Divergence),
}

impl Verdict {
    pub fn is_equivalent(&self) -> bool {
        matches!(self, Verdict::Equivalent)
    }
}

/// Compare two results; report at most `max_reported` tuples per side.
pub fn compare(baseline: &RowSet, reduced: &RowSet, max_reported: usize) -> Verdict {
    let columns = (baseline.columns != reduced.columns)
        .then(|| (baseline.columns.clone(), reduced.columns.clone()));

    let mut counts: BTreeMap<&[Value], isize> = BTreeMap::new();
    for row in &baseline.rows {
        *counts.entry(row.as_slice()).or_default() += 1;
    }
    for row in &reduced.rows {
        *counts.entry(row.as_slice()).or_default() -= 1;
    }

    let mut only_in_baseline = Vec::new();
    let mut only_in_reduced = Vec::new();
    let (mut missing, mut unexpected) = (0, 0);
    let mut truncated = false;
    for (row, delta) in counts {
        let (side, total) = match delta {
            0 => continue,
            d if d > 0 => (&mut only_in_baseline, &mut missing),
            _ => (&mut only_in_reduced, &mut unexpected),
        };
        let count = delta.unsigned_abs();
        *total += count;
        if side.len() < max_reported {
            side.push(TupleCount {
                values: row.to_vec(),
                count,
            });
        } else {
            truncated = true;
        }
    }

    if columns.is_none() && missing == 0 && unexpected == 0 {
        return Verdict::Equivalent;
    }
    Verdict::Diverged(Divergence {
        columns,
        only_in_baseline,
        only_in_reduced,
        missing,
        unexpected,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(columns: &[&str], rows: &[&[Value]]) -> RowSet {
        RowSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows.iter().map(|r| r.to_vec()).collect(),
        }
    }

    fn us(n: i64) -> [Value; 2] {
        [Value::from("US"), Value::Integer(n)]
    }

    #[test]
    fn order_does_not_matter() {
        let a = rows(&["c", "n"], &[&us(3), &us(1)]);
        let b = rows(&["c", "n"], &[&us(1), &us(3)]);
        assert_eq!(compare(&a, &b, 10), Verdict::Equivalent);
    }

    #[test]
    fn multiplicity_matters() {
        let a = rows(&["c", "n"], &[&us(1), &us(1), &us(2)]);
        let b = rows(&["c", "n"], &[&us(1), &us(2), &us(2)]);
        let Verdict::Diverged(d) = compare(&a, &b, 10) else {
            panic!("expected divergence");
        };
        assert_eq!(d.missing, 1);
        assert_eq!(d.unexpected, 1);
        assert_eq!(
            d.only_in_baseline,
            vec![TupleCount {
                values: us(1).to_vec(),
                count: 1
            }]
        );
        assert_eq!(d.only_in_reduced[0].values, us(2).to_vec());
    }

    #[test]
    fn reports_are_capped() {
        let a = rows(&["c", "n"], &[&us(1), &us(2), &us(3)]);
        let b = rows(&["c", "n"], &[]);
        let Verdict::Diverged(d) = compare(&a, &b, 2) else {
            panic!("expected divergence");
        };
        assert_eq!(d.only_in_baseline.len(), 2);
        assert_eq!(d.missing, 3);
        assert!(d.truncated);
    }

    #[test]
    fn column_mismatch_diverges() {
        let a = rows(&["c"], &[]);
        let b = rows(&["d"], &[]);
        assert!(!compare(&a, &b, 10).is_equivalent());
    }

    #[test]
    fn nulls_compare_equal_for_multisets() {
        let a = rows(&["x"], &[&[Value::Null], &[Value::Real(1.5)]]);
        let b = rows(&["x"], &[&[Value::Real(1.5)], &[Value::Null]]);
        assert!(compare(&a, &b, 10).is_equivalent());
    }
}
