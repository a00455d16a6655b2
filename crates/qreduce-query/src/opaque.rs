//! Opaque operators: model-backed functions treated as black boxes.
//!
//! Motivation
//! ----------
//! The analyzer never predicts what an opaque operator answers. It only
//! needs to know which capability a call exercises, because that decides
//! how the call is stubbed and how its output taints the rest of the query:
//!
//! - `filter`: a per-row boolean predicate;
//! - `transform`: a per-row value (completion, embedding);
//! - `reduce`: one value per group;
//! - `rerank`: a reordering of the full result.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpaqueKind {
    Filter,
    Transform,
    Reduce,
    Rerank,
}

impl OpaqueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpaqueKind::Filter => "filter",
            OpaqueKind::Transform => "transform",
            OpaqueKind::Reduce => "reduce",
            OpaqueKind::Rerank => "rerank",
        }
    }

    /// Reductions and reranks consume a whole group of rows.
    pub fn is_aggregate(self) -> bool {
        matches!(self, OpaqueKind::Reduce | OpaqueKind::Rerank)
    }

    /// Expression that replaces a call of this kind in the stubbed query:
    /// filters always pass, everything else yields NULL.
    pub fn stub(self) -> Expr {
        match self {
            OpaqueKind::Filter => Expr::Value(Value::Boolean(true)),
            _ => Expr::Value(Value::Null),
        }
    }
}

impl fmt::Display for OpaqueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Function name (case-insensitive) to opaque kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueRegistry {
    functions: BTreeMap<String, OpaqueKind>,
}

impl Default for OpaqueRegistry {
    fn default() -> Self {
        Self::llm_functions()
    }
}

impl OpaqueRegistry {
    pub fn empty() -> Self {
        Self {
            functions: BTreeMap::new(),
        }
    }

    /// The `llm_*` function family.
    pub fn llm_functions() -> Self {
        let mut registry = Self::empty();
        registry.register("llm_filter", OpaqueKind::Filter);
        for name in ["llm_complete", "llm_complete_json", "llm_embedding"] {
            registry.register(name, OpaqueKind::Transform);
        }
        for name in ["llm_reduce", "llm_reduce_json", "llm_first", "llm_last"] {
            registry.register(name, OpaqueKind::Reduce);
        }
        registry.register("llm_rerank", OpaqueKind::Rerank);
        registry
    }

    pub fn register(&mut self, name: impl AsRef<str>, kind: OpaqueKind) {
        self.functions
            .insert(name.as_ref().to_ascii_lowercase(), kind);
    }

    pub fn kind(&self, name: &str) -> Option<OpaqueKind> {
        self.functions.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, OpaqueKind)> {
        self.functions.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_functions_are_registered() {
        let registry = OpaqueRegistry::default();
        assert_eq!(registry.kind("LLM_FILTER"), Some(OpaqueKind::Filter));
        assert_eq!(registry.kind("llm_embedding"), Some(OpaqueKind::Transform));
        assert_eq!(registry.kind("llm_first"), Some(OpaqueKind::Reduce));
        assert_eq!(registry.kind("llm_rerank"), Some(OpaqueKind::Rerank));
        assert_eq!(registry.kind("lower"), None);
    }

    #[test]
    fn kinds_round_trip_through_config_names() {
        let kind: OpaqueKind = serde_json::from_str("\"rerank\"").expect("deserialize");
        assert_eq!(kind, OpaqueKind::Rerank);
        assert_eq!(kind.to_string(), "rerank");
    }

    #[test]
    fn stubs() {
        assert_eq!(OpaqueKind::Filter.stub().to_string(), "true");
        assert_eq!(OpaqueKind::Reduce.stub().to_string(), "NULL");
    }
}
