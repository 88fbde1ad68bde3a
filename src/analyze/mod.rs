//! Incremental analysis of the unified forum database.
//!
//! The analyzer holds two connections: the unified database it reads posts
//! from and the analysis database it is the only writer of. Token counting
//! runs on the worker pool; persisting always happens on the calling thread.

pub mod pool;
pub mod record;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod tokenizer;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::error::{AnalyzeError, RecordError};
use pool::WorkerPool;
use record::{analyze_record, AnalysisTask, AnalyzedRecord};
use scheduler::{ForumProgress, PendingCount};
use stats::{AnalyzerStats, StatsSnapshot};
use store::{BatchTotals, DailyStats};
use tokenizer::{TokenCounter, TokenizerKind, TokenizerSettings};

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub source_db: PathBuf,
    pub analysis_db: PathBuf,
    /// Empty: analyze every forum found in the source database.
    pub forums: Vec<String>,
    pub method: String,
    pub use_workers: bool,
    pub workers: usize,
    pub chunk_size: usize,
    pub parallel_threshold: usize,
    /// Pause after a failed continuous-mode iteration.
    pub error_backoff: Duration,
    pub show_progress: bool,
    pub tokenizer: TokenizerSettings,
}

impl AnalyzerConfig {
    /// Defaults for everything except the two database paths.
    pub fn new(source_db: impl Into<PathBuf>, analysis_db: impl Into<PathBuf>) -> Self {
        Self {
            source_db: source_db.into(),
            analysis_db: analysis_db.into(),
            forums: Vec::new(),
            method: store::DEFAULT_METHOD.to_string(),
            use_workers: true,
            workers: 4,
            chunk_size: 50,
            parallel_threshold: 10,
            error_backoff: Duration::from_secs(60),
            show_progress: false,
            tokenizer: TokenizerSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AnalyzeError> {
        if self.method.trim().is_empty() {
            return Err(AnalyzeError::Config("method must not be empty".into()));
        }
        if self.use_workers && (self.workers == 0 || self.chunk_size == 0) {
            return Err(AnalyzeError::Config(
                "workers and chunk_size must be > 0 when workers are enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Result of analyzing and persisting one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub analyzed: usize,
    pub persisted: usize,
    pub errors: usize,
    pub parallel: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub forums: Vec<String>,
    pub total_eligible: usize,
    pub total_analyzed: usize,
    pub errors: usize,
    pub batches: usize,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ContinuousSummary {
    pub iterations: usize,
    pub total_persisted: usize,
    pub failed_iterations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub method: String,
    pub tokenizer: TokenizerKind,
    pub total_posts: i64,
    pub total_analyzed: i64,
    pub progress_percent: f64,
    pub total_tokens: i64,
    pub total_words: i64,
    pub recent_days: Vec<DailyStats>,
    pub session: StatsSnapshot,
}

pub struct Analyzer {
    config: AnalyzerConfig,
    source: Connection,
    analysis: Connection,
    counter: TokenCounter,
    pool: WorkerPool,
    stats: AnalyzerStats,
}

impl Analyzer {
    /// Open both databases, create the analysis tables and pick a tokenizer.
    pub fn new(config: AnalyzerConfig) -> Result<Self, AnalyzeError> {
        let counter = TokenCounter::probe(&config.tokenizer);
        Self::with_counter(config, counter)
    }

    pub fn with_counter(config: AnalyzerConfig, counter: TokenCounter) -> Result<Self, AnalyzeError> {
        config.validate()?;
        if !config.source_db.is_file() {
            return Err(AnalyzeError::SourceNotFound(config.source_db.clone()));
        }
        if let Some(dir) = config.analysis_db.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let source = db::connect(&config.source_db)?;
        let analysis = db::connect(&config.analysis_db)?;
        let pool = if config.use_workers {
            WorkerPool::new(config.workers, config.chunk_size, config.parallel_threshold)
        } else {
            WorkerPool::disabled()
        };

        let analyzer = Self {
            config,
            source,
            analysis,
            counter,
            pool,
            stats: AnalyzerStats::new(),
        };
        analyzer.create_analysis_database()?;
        info!(
            "Analyzer ready: {} -> {} (method {}, tokenizer {}, workers {})",
            analyzer.config.source_db.display(),
            analyzer.config.analysis_db.display(),
            analyzer.config.method,
            analyzer.counter.selected(),
            analyzer.pool.workers()
        );
        Ok(analyzer)
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn stats(&self) -> &AnalyzerStats {
        &self.stats
    }

    pub fn create_analysis_database(&self) -> Result<(), AnalyzeError> {
        store::init_schema(&self.analysis)?;
        Ok(())
    }

    /// The configured forum filter, or every forum in the source database.
    pub fn resolve_forums(&self, forums: &[String]) -> Result<Vec<String>, AnalyzeError> {
        if !forums.is_empty() {
            return Ok(forums.to_vec());
        }
        if !self.config.forums.is_empty() {
            return Ok(self.config.forums.clone());
        }
        let detected = scheduler::detect_forums(&self.source)?;
        debug!("Detected forums: {:?}", detected);
        Ok(detected)
    }

    /// Up to `limit` pending posts, lowest ids first.
    pub fn scan(&self, forums: &[String], limit: usize) -> Result<Vec<AnalysisTask>, AnalyzeError> {
        let forums = self.resolve_forums(forums)?;
        let page = scheduler::scan_after(
            &self.source,
            &self.analysis,
            &forums,
            &self.config.method,
            0,
            limit,
        )?;
        Ok(page.tasks)
    }

    pub fn analyze(&self, task: &AnalysisTask) -> Result<AnalyzedRecord, RecordError> {
        analyze_record(task, &self.counter)
    }

    /// Upsert results and roll them into today's stats row.
    pub fn persist(&self, results: &[AnalyzedRecord]) -> Result<BatchTotals, AnalyzeError> {
        let totals = store::persist(&self.analysis, &self.config.method, results)?;
        self.stats.record_persisted(totals.posts, totals.tokens);
        Ok(totals)
    }

    /// Analyze `tasks` (in parallel above the threshold) and persist the
    /// successes. Failed records are logged, counted and skipped.
    pub fn process(&self, tasks: &[AnalysisTask]) -> Result<BatchOutcome, AnalyzeError> {
        if tasks.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let parallel = self.pool.is_parallel_for(tasks.len());
        let mut records = Vec::with_capacity(tasks.len());
        let mut errors = 0;
        for outcome in self.pool.run(tasks, &self.counter) {
            match outcome {
                Ok(r) => records.push(r),
                Err(e) => {
                    warn!("Skipping record: {}", e);
                    errors += 1;
                }
            }
        }
        self.stats.record_analyzed(&records);
        self.stats.record_errors(errors);

        let totals = self.persist(&records)?;
        debug!(
            "Batch of {}: {} persisted, {} errors ({})",
            tasks.len(),
            totals.posts,
            errors,
            if parallel { "parallel" } else { "sequential" }
        );
        Ok(BatchOutcome {
            analyzed: records.len(),
            persisted: totals.posts,
            errors,
            parallel,
        })
    }

    /// One bounded batch. Returns the number of records persisted.
    pub fn run_batch(&self, size: usize) -> Result<usize, AnalyzeError> {
        let tasks = self.scan(&[], size)?;
        if tasks.is_empty() {
            info!("No posts to analyze");
            return Ok(0);
        }
        Ok(self.process(&tasks)?.persisted)
    }

    pub fn count_pending(&self, forums: &[String]) -> Result<PendingCount, AnalyzeError> {
        let forums = self.resolve_forums(forums)?;
        Ok(scheduler::count_pending(
            &self.source,
            &self.analysis,
            &forums,
            &self.config.method,
        )?)
    }

    /// Analyze everything pending. The scan cursor only moves forward, so a
    /// record that fails analysis is not picked up again in the same run.
    pub fn run_all(&self, batch_size: usize) -> Result<RunSummary, AnalyzeError> {
        let t0 = Instant::now();
        let forums = self.resolve_forums(&[])?;
        let mut summary = RunSummary {
            forums: forums.clone(),
            ..RunSummary::default()
        };
        if forums.is_empty() {
            warn!("No forums found in {}", self.config.source_db.display());
            return Ok(summary);
        }

        let pending = scheduler::count_pending(&self.source, &self.analysis, &forums, &self.config.method)?;
        summary.total_eligible = pending.pending;
        info!(
            "Analyzing {} pending posts of {} eligible in forums {:?}",
            pending.pending, pending.eligible, forums
        );

        let pb = self.progress_bar(pending.pending as u64);
        let mut cursor = 0;
        loop {
            let page = scheduler::scan_after(
                &self.source,
                &self.analysis,
                &forums,
                &self.config.method,
                cursor,
                batch_size.max(1),
            )?;
            cursor = page.cursor;
            if !page.tasks.is_empty() {
                let outcome = self.process(&page.tasks)?;
                summary.total_analyzed += outcome.persisted;
                summary.errors += outcome.errors;
                summary.batches += 1;
                pb.inc(page.tasks.len() as u64);
            }
            if page.exhausted || page.tasks.is_empty() {
                break;
            }
        }
        pb.finish_and_clear();

        summary.elapsed_secs = t0.elapsed().as_secs_f64();
        info!(
            "Analysis finished: {}/{} posts, {} errors, {} batches",
            summary.total_analyzed, summary.total_eligible, summary.errors, summary.batches
        );
        Ok(summary)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, eta {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        pb
    }

    /// Poll for new posts until `stop` turns true. The signal is checked at
    /// the top of every iteration and while sleeping, never mid-batch.
    pub async fn run_continuous(
        &self,
        interval: Duration,
        batch_size: usize,
        mut stop: watch::Receiver<bool>,
    ) -> ContinuousSummary {
        let mut summary = ContinuousSummary::default();
        let mut cursor = 0;
        info!(
            "Continuous analysis: batch {} every {}s",
            batch_size,
            interval.as_secs()
        );

        loop {
            if *stop.borrow() {
                break;
            }
            summary.iterations += 1;
            // Blocking SQLite and rayon work on this task. The caller awaits
            // this future directly; the stop signal is sent from another task.
            let pause = match self.continuous_step(cursor, batch_size) {
                Ok((outcome, next, exhausted)) => {
                    summary.total_persisted += outcome.persisted;
                    cursor = if exhausted { 0 } else { next };
                    if outcome.persisted > 0 {
                        info!("Persisted {} posts ({} errors)", outcome.persisted, outcome.errors);
                    }
                    (exhausted && outcome.persisted == 0).then_some(interval)
                }
                Err(e) => {
                    summary.failed_iterations += 1;
                    error!("Analysis iteration failed, retrying in {}s: {}", self.config.error_backoff.as_secs(), e);
                    cursor = 0;
                    Some(self.config.error_backoff)
                }
            };
            if let Some(duration) = pause {
                debug!("Sleeping {}s", duration.as_secs());
                if wait_or_stop(&mut stop, duration).await {
                    break;
                }
            }
        }

        info!(
            "Continuous analysis stopped after {} iterations, {} posts persisted",
            summary.iterations, summary.total_persisted
        );
        summary
    }

    fn continuous_step(
        &self,
        cursor: i64,
        batch_size: usize,
    ) -> Result<(BatchOutcome, i64, bool), AnalyzeError> {
        let forums = self.resolve_forums(&[])?;
        let page = scheduler::scan_after(
            &self.source,
            &self.analysis,
            &forums,
            &self.config.method,
            cursor,
            batch_size.max(1),
        )?;
        let outcome = self.process(&page.tasks)?;
        Ok((outcome, page.cursor, page.exhausted || page.tasks.is_empty()))
    }

    pub fn forums_info(&self) -> Result<Vec<ForumProgress>, AnalyzeError> {
        Ok(scheduler::forums_info(
            &self.source,
            &self.analysis,
            &self.config.method,
        )?)
    }

    pub fn summary(&self) -> Result<AnalysisSummary, AnalyzeError> {
        let total_posts: i64 = self
            .source
            .query_row("SELECT COUNT(*) FROM forum_posts", [], |r| r.get(0))?;
        let (total_analyzed, total_tokens, total_words) =
            store::totals(&self.analysis, &self.config.method)?;
        Ok(AnalysisSummary {
            method: self.config.method.clone(),
            tokenizer: self.counter.selected(),
            total_posts,
            total_analyzed,
            progress_percent: scheduler::percent(total_analyzed as usize, total_posts as usize),
            total_tokens,
            total_words,
            recent_days: store::recent_daily_stats(&self.analysis, 7)?,
            session: self.stats.snapshot(),
        })
    }
}

/// Sleep for `duration` unless the stop flag is raised first. Returns true
/// when the caller should stop; a dropped sender counts as a stop.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    let changed = tokio::select! {
        _ = tokio::time::sleep(duration) => None,
        res = stop.changed() => Some(res.is_ok()),
    };
    match changed {
        None => false,
        Some(false) => true,
        Some(true) => *stop.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        let mut c = AnalyzerConfig::new("a.db", "b.db");
        assert!(c.validate().is_ok());
        c.method = " ".into();
        assert!(matches!(c.validate(), Err(AnalyzeError::Config(_))));

        let mut c = AnalyzerConfig::new("a.db", "b.db");
        c.workers = 0;
        assert!(c.validate().is_err());
        c.use_workers = false;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalyzerConfig::new(dir.path().join("nope.db"), dir.path().join("a.db"));
        assert!(matches!(
            Analyzer::new(config),
            Err(AnalyzeError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn wait_returns_early_on_stop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(wait_or_stop(&mut rx, Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn wait_times_out_without_stop() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!wait_or_stop(&mut rx, Duration::from_millis(5)).await);
    }
}
