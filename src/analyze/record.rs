use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::tokenizer::{filtered_word_count, TokenCounter, TokenizerKind};
use crate::error::RecordError;

/// One post waiting for analysis. Raw bytes so a single badly encoded post
/// cannot fail the scan that selected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisTask {
    pub post_id: i64,
    pub content: Vec<u8>,
}

impl AnalysisTask {
    pub fn new(post_id: i64, content: impl Into<Vec<u8>>) -> Self {
        Self {
            post_id,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedRecord {
    pub post_id: i64,
    pub token_count: usize,
    pub word_count: usize,
    pub character_count: usize,
    pub analysis_hash: String,
    pub analyzed_at: DateTime<Local>,
    pub processing_time_ms: f64,
    pub tokenizer: TokenizerKind,
    /// The primary tokenizer failed on this record.
    #[serde(skip)]
    pub fell_back: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextMetrics {
    pub tokens: usize,
    pub words: usize,
    pub characters: usize,
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Character, word and token counts. Empty text is all zeros.
pub fn text_metrics(text: &str, counter: &TokenCounter) -> (TextMetrics, TokenizerKind, bool) {
    if text.is_empty() {
        return (TextMetrics::default(), counter.selected(), false);
    }
    let count = counter.count(text);
    let metrics = TextMetrics {
        tokens: count.tokens,
        words: filtered_word_count(text, counter.min_word_length()),
        characters: text.chars().count(),
    };
    (metrics, count.kind, count.fell_back)
}

/// Analyze one record. Pure: touches no shared state, safe on any worker.
pub fn analyze_record(
    task: &AnalysisTask,
    counter: &TokenCounter,
) -> Result<AnalyzedRecord, RecordError> {
    let start = Instant::now();
    let text = std::str::from_utf8(&task.content).map_err(|_| RecordError::InvalidUtf8 {
        post_id: task.post_id,
    })?;

    let (metrics, tokenizer, fell_back) = text_metrics(text, counter);
    let analysis_hash = content_hash(text);

    Ok(AnalyzedRecord {
        post_id: task.post_id,
        token_count: metrics.tokens,
        word_count: metrics.words,
        character_count: metrics.characters,
        analysis_hash,
        analyzed_at: Local::now(),
        processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        tokenizer,
        fell_back,
    })
}
