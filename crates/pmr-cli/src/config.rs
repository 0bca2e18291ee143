//! # Configuration
//!
//! Optional TOML file. Every section and key has a default, so an empty file
//! (or no file) is a valid configuration. Command-line flags override it.
//!
//! ```toml
//! [engine]
//! kind = "partial"
//! eadr = false
//! jobs = 4
//!
//! [checker]
//! timeout_secs = 30
//! args = ["--strict"]
//!
//! [trace]
//! delimiter = ";"
//! record_separator = "|"
//! unknown_operations = "skip"
//! strict_regions = true
//!
//! [trace.aliases]
//! PMEM_STORE = "STORE"
//!
//! [output]
//! type = "json"
//! path = "results.jsonl"
//! level = "warning"
//! keep_failing_images = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use pmr_core::{EngineKind, TraceOptions, UnknownOperationPolicy};
use pmr_io::{OutputLevel, SinkKind};

/// Loaded when `--config` is not given and the file exists.
pub const DEFAULT_CONFIG_FILE: &str = "pmr.toml";

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,
    #[serde(default)]
    pub eadr: bool,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            eadr: false,
            jobs: default_jobs(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct CheckerConfig {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Passed to `prog` checkers ahead of any command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraceConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_record_separator")]
    pub record_separator: char,
    #[serde(default)]
    pub unknown_operations: UnknownOperationPolicy,
    #[serde(default = "default_strict_regions")]
    pub strict_regions: bool,
    /// Custom tag -> builtin tag.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            record_separator: default_record_separator(),
            unknown_operations: UnknownOperationPolicy::default(),
            strict_regions: default_strict_regions(),
            aliases: BTreeMap::new(),
        }
    }
}

impl TraceConfig {
    pub fn options(&self) -> TraceOptions {
        TraceOptions {
            delimiter: self.delimiter,
            record_separator: self.record_separator,
            unknown_operations: self.unknown_operations,
            strict_regions: self.strict_regions,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct OutputConfig {
    #[serde(default, rename = "type")]
    pub kind: SinkKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub level: OutputLevel,
    /// Fixed scratch directory. A fresh temporary directory otherwise.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default)]
    pub keep_failing_images: bool,
}

fn default_jobs() -> usize {
    1
}
fn default_delimiter() -> char {
    ';'
}
fn default_record_separator() -> char {
    '|'
}
fn default_strict_regions() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load `explicit`, or [`DEFAULT_CONFIG_FILE`] if it exists, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
