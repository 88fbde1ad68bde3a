use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::record::AnalyzedRecord;
use super::tokenizer::TokenizerKind;

/// Counters for one analyzer instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub records_analyzed: u64,
    pub records_persisted: u64,
    pub processing_errors: u64,
    pub primary_tokens: u64,
    pub heuristic_tokens: u64,
    /// Records where the primary tokenizer failed and the heuristic stepped in.
    pub tokenizer_fallbacks: u64,
    pub total_tokens: u64,
    pub last_analysis_at: Option<DateTime<Local>>,
}

#[derive(Debug, Default)]
pub struct AnalyzerStats {
    inner: Mutex<StatsSnapshot>,
}

impl AnalyzerStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        // Counters stay usable even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_analyzed(&self, records: &[AnalyzedRecord]) {
        let mut s = self.lock();
        for r in records {
            s.records_analyzed += 1;
            match r.tokenizer {
                TokenizerKind::Primary => s.primary_tokens += 1,
                TokenizerKind::Heuristic => s.heuristic_tokens += 1,
            }
            if r.fell_back {
                s.tokenizer_fallbacks += 1;
            }
        }
    }

    pub fn record_persisted(&self, count: usize, tokens: u64) {
        let mut s = self.lock();
        s.records_persisted += count as u64;
        s.total_tokens += tokens;
        s.last_analysis_at = Some(Local::now());
    }

    pub fn record_errors(&self, count: usize) {
        self.lock().processing_errors += count as u64;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = StatsSnapshot::default();
    }
}
