//! `token_analysis` / `analysis_stats`: the analysis state of the unified store.

use std::collections::HashSet;

use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use tracing::info;

use super::record::AnalyzedRecord;
use crate::db::{quote_ident, table_exists};

pub const DEFAULT_METHOD: &str = "tokens-v1";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS token_analysis (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        post_id            INTEGER NOT NULL,
        method             TEXT NOT NULL DEFAULT 'tokens-v1',
        tokenizer          TEXT NOT NULL DEFAULT 'heuristic',
        token_count        INTEGER NOT NULL,
        word_count         INTEGER NOT NULL,
        character_count    INTEGER NOT NULL,
        analysis_hash      TEXT NOT NULL,
        analyzed_at        TEXT NOT NULL,
        processing_time_ms REAL NOT NULL,
        created_at         TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(post_id, method)
    );
    CREATE INDEX IF NOT EXISTS idx_token_analysis_post_id ON token_analysis(post_id);
    CREATE INDEX IF NOT EXISTS idx_token_analysis_date ON token_analysis(analyzed_at);

    CREATE TABLE IF NOT EXISTS analysis_stats (
        id                      INTEGER PRIMARY KEY AUTOINCREMENT,
        analysis_date           TEXT NOT NULL UNIQUE,
        posts_analyzed          INTEGER NOT NULL,
        total_tokens            INTEGER NOT NULL,
        total_words             INTEGER NOT NULL,
        total_characters        INTEGER NOT NULL,
        processing_time_seconds REAL NOT NULL,
        created_at              TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX IF NOT EXISTS idx_analysis_stats_date ON analysis_stats(analysis_date);
";

/// Create the analysis tables. Tables written by older tools (keyed by
/// `post_id` alone, one stats row per run) are rebuilt into the current shape
/// first, keeping their rows.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    upgrade_token_analysis(&tx)?;
    upgrade_analysis_stats(&tx)?;
    tx.execute_batch(SCHEMA)?;
    tx.commit()
}

fn column_names(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Whether `table` has a unique index over exactly `columns`.
fn has_unique_key(conn: &Connection, table: &str, columns: &[&str]) -> rusqlite::Result<bool> {
    let mut list = conn.prepare(&format!("PRAGMA index_list({})", quote_ident(table)))?;
    let unique: Vec<String> = list
        .query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, bool>(2)?)))?
        .filter_map(|r| match r {
            Ok((name, true)) => Some(Ok(name)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
        .collect::<Result<_, _>>()?;
    for index in unique {
        let mut info = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&index)))?;
        let indexed = info
            .query_map([], |r| r.get::<_, Option<String>>(2))?
            .collect::<Result<Vec<_>, _>>()?;
        if indexed.len() == columns.len()
            && columns.iter().all(|c| indexed.iter().any(|i| i.as_deref() == Some(*c)))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn upgrade_token_analysis(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "token_analysis")? {
        return Ok(());
    }
    let existing = column_names(conn, "token_analysis")?;
    if existing.iter().any(|c| c == "method") {
        if !existing.iter().any(|c| c == "tokenizer") {
            conn.execute_batch(
                "ALTER TABLE token_analysis ADD COLUMN tokenizer TEXT NOT NULL DEFAULT 'heuristic'",
            )?;
            info!("Added tokenizer to token_analysis");
        }
        if !has_unique_key(conn, "token_analysis", &["post_id", "method"])? {
            rebuild_token_analysis(conn, &existing)?;
        }
        return Ok(());
    }
    rebuild_token_analysis(conn, &existing)
}

/// Move rows into a fresh `token_analysis`; rows without a method get the
/// default one.
fn rebuild_token_analysis(conn: &Connection, existing: &[String]) -> rusqlite::Result<()> {
    conn.execute_batch(
        "DROP INDEX IF EXISTS idx_token_analysis_post_id;
         DROP INDEX IF EXISTS idx_token_analysis_date;
         ALTER TABLE token_analysis RENAME TO token_analysis_old;",
    )?;
    conn.execute_batch(SCHEMA)?;
    let current = column_names(conn, "token_analysis")?;
    let shared: Vec<&String> = existing.iter().filter(|c| current.contains(c)).collect();
    let insert_cols: Vec<String> = shared.iter().map(|c| quote_ident(c)).collect();
    let select_cols: Vec<String> = shared
        .iter()
        .map(|c| match c.as_str() {
            "created_at" => "COALESCE(created_at, datetime('now'))".to_string(),
            _ => quote_ident(c),
        })
        .collect();
    let moved = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO token_analysis ({}) SELECT {} FROM token_analysis_old",
            insert_cols.join(", "),
            select_cols.join(", ")
        ),
        [],
    )?;
    conn.execute_batch("DROP TABLE token_analysis_old")?;
    info!("Upgraded token_analysis to per-method rows ({} rows kept)", moved);
    Ok(())
}

/// Older stats tables hold one row per run; fold them into one row per date.
fn upgrade_analysis_stats(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "analysis_stats")?
        || has_unique_key(conn, "analysis_stats", &["analysis_date"])?
    {
        return Ok(());
    }
    conn.execute_batch(
        "DROP INDEX IF EXISTS idx_analysis_stats_date;
         ALTER TABLE analysis_stats RENAME TO analysis_stats_old;",
    )?;
    conn.execute_batch(SCHEMA)?;
    let days = conn.execute(
        "INSERT INTO analysis_stats
         (analysis_date, posts_analyzed, total_tokens, total_words, total_characters,
          processing_time_seconds)
         SELECT analysis_date, SUM(posts_analyzed), SUM(total_tokens), SUM(total_words),
                SUM(total_characters), SUM(processing_time_seconds)
         FROM analysis_stats_old
         GROUP BY analysis_date",
        [],
    )?;
    conn.execute_batch("DROP TABLE analysis_stats_old")?;
    info!("Upgraded analysis_stats to one row per date ({} days)", days);
    Ok(())
}

/// Totals of the records a persist call actually wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchTotals {
    pub posts: usize,
    pub tokens: u64,
    pub words: u64,
    pub characters: u64,
    pub processing_time_seconds: f64,
}

impl BatchTotals {
    fn add(&mut self, r: &AnalyzedRecord) {
        self.posts += 1;
        self.tokens += r.token_count as u64;
        self.words += r.word_count as u64;
        self.characters += r.character_count as u64;
        self.processing_time_seconds += r.processing_time_ms / 1000.0;
    }
}

/// Upsert a batch keyed by `(post_id, method)` and roll it into today's
/// stats row, all in one transaction. A row whose stored hash matches is left
/// untouched and not counted.
pub fn persist(
    conn: &Connection,
    method: &str,
    records: &[AnalyzedRecord],
) -> rusqlite::Result<BatchTotals> {
    let mut totals = BatchTotals::default();
    if records.is_empty() {
        return Ok(totals);
    }

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO token_analysis
             (post_id, method, tokenizer, token_count, word_count, character_count,
              analysis_hash, analyzed_at, processing_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(post_id, method) DO UPDATE SET
                tokenizer = excluded.tokenizer,
                token_count = excluded.token_count,
                word_count = excluded.word_count,
                character_count = excluded.character_count,
                analysis_hash = excluded.analysis_hash,
                analyzed_at = excluded.analyzed_at,
                processing_time_ms = excluded.processing_time_ms
             WHERE token_analysis.analysis_hash <> excluded.analysis_hash",
        )?;
        for r in records {
            let changed = stmt.execute(params![
                r.post_id,
                method,
                r.tokenizer.as_str(),
                r.token_count as i64,
                r.word_count as i64,
                r.character_count as i64,
                r.analysis_hash,
                r.analyzed_at.to_rfc3339(),
                r.processing_time_ms,
            ])?;
            if changed > 0 {
                totals.add(r);
            }
        }
    }
    if totals.posts > 0 {
        add_daily_stats(&tx, &chrono::Local::now().date_naive().to_string(), &totals)?;
    }
    tx.commit()?;
    Ok(totals)
}

/// Create or increment the stats row of `date` (YYYY-MM-DD).
pub fn add_daily_stats(conn: &Connection, date: &str, totals: &BatchTotals) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO analysis_stats
         (analysis_date, posts_analyzed, total_tokens, total_words, total_characters,
          processing_time_seconds)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(analysis_date) DO UPDATE SET
            posts_analyzed = posts_analyzed + excluded.posts_analyzed,
            total_tokens = total_tokens + excluded.total_tokens,
            total_words = total_words + excluded.total_words,
            total_characters = total_characters + excluded.total_characters,
            processing_time_seconds = processing_time_seconds + excluded.processing_time_seconds",
        params![
            date,
            totals.posts as i64,
            totals.tokens as i64,
            totals.words as i64,
            totals.characters as i64,
            totals.processing_time_seconds,
        ],
    )?;
    Ok(())
}

/// Which of `post_ids` already have a row for `method`.
pub fn analyzed_among(
    conn: &Connection,
    method: &str,
    post_ids: &[i64],
) -> rusqlite::Result<HashSet<i64>> {
    if post_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let placeholders = vec!["?"; post_ids.len()].join(",");
    let sql = format!(
        "SELECT post_id FROM token_analysis WHERE method = ? AND post_id IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let params = std::iter::once(rusqlite::types::Value::Text(method.to_string()))
        .chain(post_ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));
    let rows = stmt
        .query_map(params_from_iter(params), |row| row.get(0))?
        .collect::<Result<HashSet<i64>, _>>()?;
    Ok(rows)
}

pub fn analyzed_ids(conn: &Connection, method: &str) -> rusqlite::Result<HashSet<i64>> {
    let mut stmt = conn.prepare("SELECT post_id FROM token_analysis WHERE method = ?1")?;
    let rows = stmt
        .query_map([method], |row| row.get(0))?
        .collect::<Result<HashSet<i64>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAnalysis {
    pub post_id: i64,
    pub tokenizer: String,
    pub token_count: i64,
    pub word_count: i64,
    pub character_count: i64,
    pub analysis_hash: String,
    pub analyzed_at: String,
    pub processing_time_ms: f64,
}

pub fn fetch_analysis(
    conn: &Connection,
    method: &str,
    post_id: i64,
) -> rusqlite::Result<Option<StoredAnalysis>> {
    let mut stmt = conn.prepare(
        "SELECT post_id, tokenizer, token_count, word_count, character_count,
                analysis_hash, analyzed_at, processing_time_ms
         FROM token_analysis WHERE method = ?1 AND post_id = ?2",
    )?;
    let mut rows = stmt.query(params![method, post_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(StoredAnalysis {
            post_id: row.get(0)?,
            tokenizer: row.get(1)?,
            token_count: row.get(2)?,
            word_count: row.get(3)?,
            character_count: row.get(4)?,
            analysis_hash: row.get(5)?,
            analyzed_at: row.get(6)?,
            processing_time_ms: row.get(7)?,
        })),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub posts_analyzed: i64,
    pub total_tokens: i64,
    pub total_words: i64,
    pub total_characters: i64,
    pub processing_time_seconds: f64,
}

pub fn recent_daily_stats(conn: &Connection, days: usize) -> rusqlite::Result<Vec<DailyStats>> {
    let mut stmt = conn.prepare(
        "SELECT analysis_date, posts_analyzed, total_tokens, total_words, total_characters,
                processing_time_seconds
         FROM analysis_stats
         ORDER BY analysis_date DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([days as i64], |row| {
            Ok(DailyStats {
                date: row.get(0)?,
                posts_analyzed: row.get(1)?,
                total_tokens: row.get(2)?,
                total_words: row.get(3)?,
                total_characters: row.get(4)?,
                processing_time_seconds: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// (rows, sum of tokens, sum of words) for `method`.
pub fn totals(conn: &Connection, method: &str) -> rusqlite::Result<(i64, i64, i64)> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(token_count), 0), COALESCE(SUM(word_count), 0)
         FROM token_analysis WHERE method = ?1",
        [method],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
}
