//! Layered settings: defaults, optional TOML file, `FORUMDB_*` environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::analyze::tokenizer::TokenizerSettings;
use crate::analyze::AnalyzerConfig;
use crate::merge::MergeOptions;

pub const ENV_PREFIX: &str = "FORUMDB";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory scanned for per-source databases.
    pub source_dir: PathBuf,
    /// File name glob for per-source databases.
    pub source_pattern: String,
    /// Unified database written by `merge`.
    pub target_db: PathBuf,
    /// Unified database read by `analyze`.
    pub source_db: PathBuf,
    /// Database holding `token_analysis` / `analysis_stats`.
    pub analysis_db: PathBuf,
    /// Rows per insert batch while merging.
    pub merge_batch_size: usize,
    pub batch_size: usize,
    pub interval_secs: u64,
    pub error_backoff_secs: u64,
    pub use_workers: bool,
    pub workers: usize,
    pub chunk_size: usize,
    /// Batches larger than this go to the worker pool.
    pub parallel_threshold: usize,
    /// Empty means: detect from the `forums` table.
    pub forums: Vec<String>,
    pub min_word_length: usize,
    pub language_factor: f64,
    pub tokenizer_path: Option<PathBuf>,
    /// Method/version tag stored with every analysis row.
    pub method: String,
    pub show_progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("data/databases"),
            source_pattern: "forum_*.db".to_string(),
            target_db: PathBuf::from("data/databases/merged_forums.db"),
            source_db: PathBuf::from("data/databases/merged_forums.db"),
            analysis_db: PathBuf::from("data/databases/analysis_forums.db"),
            merge_batch_size: 1000,
            batch_size: 100,
            interval_secs: 300,
            error_backoff_secs: 60,
            use_workers: true,
            workers: 4,
            chunk_size: 50,
            parallel_threshold: 10,
            forums: Vec::new(),
            min_word_length: 2,
            language_factor: 0.75,
            tokenizer_path: None,
            method: "tokens-v1".to_string(),
            show_progress: true,
        }
    }
}

impl Settings {
    /// Load from an optional file plus the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_from(file, None)
    }

    /// Like [`Settings::load`], with an explicit environment map instead of
    /// the process environment when `env` is given.
    pub fn load_from(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("forums")
                .source(env),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Failed to parse settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.merge_batch_size == 0 {
            bail!("merge_batch_size must be > 0");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be > 0");
        }
        if self.interval_secs == 0 {
            bail!("interval_secs must be > 0");
        }
        if self.use_workers && self.workers == 0 {
            bail!("workers must be > 0");
        }
        if self.use_workers && self.chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if !(self.language_factor > 0.0 && self.language_factor.is_finite()) {
            bail!("language_factor must be a positive number");
        }
        if self.method.trim().is_empty() {
            bail!("method must not be empty");
        }
        if self.source_pattern.trim().is_empty() {
            bail!("source_pattern must not be empty");
        }
        Ok(())
    }

    /// Merge into `target_db`; sidecar analysis rows go to `analysis_db`, the
    /// database the analyzer reads.
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            target: self.target_db.clone(),
            use_offsets: true,
            recreate: true,
            batch_size: self.merge_batch_size,
            analysis_target: Some(self.analysis_db.clone()),
            show_progress: self.show_progress,
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            source_db: self.source_db.clone(),
            analysis_db: self.analysis_db.clone(),
            forums: self.forums.clone(),
            method: self.method.clone(),
            use_workers: self.use_workers,
            workers: self.workers,
            chunk_size: self.chunk_size,
            parallel_threshold: self.parallel_threshold,
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            show_progress: self.show_progress,
            tokenizer: TokenizerSettings {
                min_word_length: self.min_word_length,
                language_factor: self.language_factor,
                tokenizer_path: self.tokenizer_path.clone(),
            },
        }
    }
}
