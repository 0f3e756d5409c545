use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::matcher::Thresholds;
use crate::services::context::{DEFAULT_WORKERS, MAX_WORKERS};
use crate::services::store::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    pub enabled: bool,
    pub program: String,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "tesseract".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory backing the local object store; buckets are its sub-directories.
    pub store_root: PathBuf,
    pub bucket: String,
    pub workers: usize,
    pub verify_uploads: bool,
    pub retry: RetrySettings,
    pub thresholds: Thresholds,
    pub event_log: Option<PathBuf>,
    pub ocr: OcrSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("."),
            bucket: String::new(),
            workers: DEFAULT_WORKERS,
            verify_uploads: true,
            retry: RetrySettings::default(),
            thresholds: Thresholds::default(),
            event_log: default_event_log(),
            ocr: OcrSettings::default(),
        }
    }
}

/// `~/Documents/Sortrs/session_log.jsonl`
pub fn default_event_log() -> Option<PathBuf> {
    let documents = dirs::document_dir().or_else(|| dirs::home_dir().map(|h| h.join("Documents")))?;
    Some(documents.join("Sortrs").join("session_log.jsonl"))
}

fn environment() -> Environment {
    Environment::with_prefix("SORTRS")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    /// Defaults, then `sortrs.toml` in the working directory (or `path`),
    /// then `SORTRS_*` environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => ConfigFile::from(path).required(true),
            None => ConfigFile::with_name("sortrs").required(false),
        };

        Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize::<Settings>()
    }

    pub fn workers(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }
}
