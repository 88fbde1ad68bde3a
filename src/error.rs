//! Error types shared by the merger and the analyzer.

use std::path::PathBuf;

/// Structural failures of a merge. Anything returned as `Err` aborts the
/// affected unit of work; sources merged before it stay committed.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("no source databases to merge")]
    NoSources,

    #[error("source database not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("schema conflict on table {table}: {detail}")]
    SchemaConflict { table: String, detail: String },

    #[error("merging {source_name} failed on table {table}: {error}")]
    Table {
        source_name: String,
        table: String,
        #[source]
        error: rusqlite::Error,
    },

    #[error("invalid source pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MergeError {
    /// Table the failure is attributed to, when there is one.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::SchemaConflict { table, .. } | Self::Table { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// Failures surfaced by the analyzer to its caller.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error("source database not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("invalid analyzer configuration: {0}")]
    Config(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single record could not be analyzed. Counted and skipped, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("post {post_id}: content is not valid UTF-8")]
    InvalidUtf8 { post_id: i64 },
}

/// The primary tokenizer rejected an input.
#[derive(Debug, thiserror::Error)]
#[error("tokenizer failed: {0}")]
pub struct TokenizeError(pub String);
