//! Compilation options.
//!
//! Options are plain serde data so they can be loaded from a JSON config file
//! in the application config directory, or built in code.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "linkql";
const CONFIG_FILE: &str = "config.json";

/// Stop words handed to concept (more-like-this) queries.
pub const DEFAULT_CONCEPT_STOP_WORDS: &[&str] = &[
    "http", "span", "class", "flashtext", "let", "its", "may", "well", "got", "too", "them",
    "really", "new", "set", "please", "how", "our", "from", "sent", "subject", "sincerely",
    "thank", "thanks", "just", "get", "going", "were", "much", "can", "also", "that", "this",
    "with", "have", "will", "would", "your", "you", "what", "when", "which", "there",
];

/// Options controlling a single compilation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Pseudo-field that stands for every catch-all eligible field
    pub catch_all_field: String,

    /// Maximum number of distinct join keys fetched per field-data load
    pub fielddata_size: usize,

    /// Fetch every distinct join key instead of stopping at `fielddata_size`
    pub full_fielddata: bool,

    /// Estimate hit counts and materialize the cheaper side of user-written expansions
    pub invert_expansions: bool,

    /// Queries excluded from every search against an index that carries
    /// transaction metadata (e.g. invisible or deleted rows)
    pub exclusions: Vec<Value>,

    /// Upper bound on repetitions of any fixed-point optimizer stage
    pub max_fixed_point_iterations: usize,

    /// Stop words used for CONCEPT / FUZZY_CONCEPT queries
    pub concept_stop_words: Vec<String>,

    /// Capacity of the per-compilation analyzer result cache
    pub analysis_cache_size: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            catch_all_field: crate::query::CATCH_ALL_FIELD.to_string(),
            fielddata_size: 10_000,
            full_fielddata: false,
            invert_expansions: true,
            exclusions: Vec::new(),
            max_fixed_point_iterations: 32,
            concept_stop_words: DEFAULT_CONCEPT_STOP_WORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            analysis_cache_size: 1024,
        }
    }
}

impl CompileOptions {
    /// Load options from an explicit JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let options: CompileOptions =
            serde_json::from_str(&content).context("Failed to parse config file")?;
        Ok(options)
    }

    /// Load options from the user config directory, or return defaults if not found
    pub fn load_default() -> Result<Self> {
        match get_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Size bound for a field-data load; `None` means unbounded
    pub fn fielddata_limit(&self) -> Option<usize> {
        if self.full_fielddata {
            None
        } else {
            Some(self.fielddata_size)
        }
    }
}

/// Get the path of the default config file, if a config directory exists
pub fn get_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join(APP_NAME).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let options: CompileOptions =
            serde_json::from_str(r#"{"fielddata_size": 50}"#).unwrap();
        assert_eq!(options.fielddata_size, 50);
        assert!(options.invert_expansions);
        assert_eq!(options.max_fixed_point_iterations, 32);
        assert_eq!(options.catch_all_field, "_all");
    }

    #[test]
    fn test_fielddata_limit() {
        let mut options = CompileOptions::default();
        assert_eq!(options.fielddata_limit(), Some(10_000));
        options.full_fielddata = true;
        assert_eq!(options.fielddata_limit(), None);
    }
}
