//! Analyzer configuration.
//!
//! Loaded from a JSON file; every field is optional:
//!
//! ```json
//! {
//!   "opaque_functions": { "classify_sentiment": "transform" },
//!   "max_fixpoint_rounds": 64,
//!   "group_prepass": true,
//!   "engine_retries": 2,
//!   "retry_backoff_ms": 25,
//!   "max_reported_tuples": 20
//! }
//! ```
//!
//! `opaque_functions` adds to the built-in `llm_*` family; an entry with a
//! built-in name overrides its kind.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use qreduce_engine::RetryPolicy;
use qreduce_planner::PlannerConfig;
use qreduce_query::{OpaqueKind, OpaqueRegistry};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    pub opaque_functions: BTreeMap<String, OpaqueKind>,
    pub max_fixpoint_rounds: usize,
    pub group_prepass: bool,
    pub engine_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_reported_tuples: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            opaque_functions: BTreeMap::new(),
            max_fixpoint_rounds: 64,
            group_prepass: true,
            engine_retries: 2,
            retry_backoff_ms: 25,
            max_reported_tuples: 20,
        }
    }
}

impl AnalyzerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.opaque_functions.keys() {
            let valid = !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                return Err(ConfigError::Invalid(format!(
                    "opaque function name `{name}` is not an identifier"
                )));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> OpaqueRegistry {
        let mut registry = OpaqueRegistry::default();
        for (name, kind) in &self.opaque_functions {
            registry.register(name, *kind);
        }
        registry
    }

    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            max_rounds: self.max_fixpoint_rounds,
            group_prepass: self.group_prepass,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.engine_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(text.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn missing_fields_take_defaults() {
        let file = write_config(r#"{ "group_prepass": false }"#);
        let config = AnalyzerConfig::from_json_file(file.path()).expect("load");
        assert!(!config.group_prepass);
        assert_eq!(config.max_fixpoint_rounds, 64);
        assert_eq!(config.retry().retries, 2);
    }

    #[test]
    fn extra_opaque_functions_extend_the_registry() {
        let file = write_config(r#"{ "opaque_functions": { "Classify_Sentiment": "transform" } }"#);
        let config = AnalyzerConfig::from_json_file(file.path()).expect("load");
        let registry = config.registry();
        assert_eq!(registry.kind("classify_sentiment"), Some(OpaqueKind::Transform));
        assert_eq!(registry.kind("llm_filter"), Some(OpaqueKind::Filter));
    }

    #[test]
    fn unknown_fields_and_bad_names_are_rejected() {
        let file = write_config(r#"{ "max_rounds": 3 }"#);
        let err = AnalyzerConfig::from_json_file(file.path()).expect_err("unknown field");
        assert!(matches!(err, ConfigError::Parse { .. }), "err={err}");

        let file = write_config(r#"{ "opaque_functions": { "bad name": "filter" } }"#);
        let err = AnalyzerConfig::from_json_file(file.path()).expect_err("bad name");
        assert!(matches!(err, ConfigError::Invalid(_)), "err={err}");

        let file = write_config(r#"{ "opaque_functions": { "f": "summarize" } }"#);
        let err = AnalyzerConfig::from_json_file(file.path()).expect_err("bad kind");
        assert!(err.to_string().contains("summarize"), "err={err}");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = AnalyzerConfig::from_json_file(Path::new("/nonexistent/qreduce.json"))
            .expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
