//! Per-source analysis databases (`<stem>_analysis.db` next to the source).
//! Their rows are carried into the unified analysis tables using the post
//! and user offsets of the source they belong to.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use tracing::{debug, info};

use crate::analyze::store::{self, BatchTotals};
use crate::db::{connect_read_only, owned_value, quote_ident, table_exists};
use crate::error::MergeError;
use crate::merge::offsets::OffsetMap;
use crate::merge::schema::{self, describe_table, list_tables, table_columns};

const TOKEN_TABLE: &str = "token_analysis";
const STATS_TABLE: &str = "analysis_stats";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SidecarTable {
    pub table: String,
    pub read: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SidecarReport {
    pub path: PathBuf,
    pub tables: Vec<SidecarTable>,
}

pub fn sidecar_path(source: &Path) -> Option<PathBuf> {
    let stem = source.file_stem()?.to_str()?;
    Some(source.with_file_name(format!("{stem}_analysis.db")))
}

/// Tables carried over from a sidecar: the two analysis tables and any
/// gender prediction table.
pub fn is_sidecar_table(name: &str) -> bool {
    name == TOKEN_TABLE || name == STATS_TABLE || name.contains("gender")
}

/// Merge the sidecar of `source`, if there is one. `Ok(None)` means no
/// sidecar exists.
pub fn merge_sidecar(
    source: &Path,
    target: &Connection,
    offsets: &OffsetMap,
) -> Result<Option<SidecarReport>, MergeError> {
    let Some(path) = sidecar_path(source).filter(|p| p.is_file()) else {
        return Ok(None);
    };
    info!("Merging analysis sidecar {}", path.display());
    let sidecar = connect_read_only(&path)?;
    store::init_schema(target)?;

    let mut report = SidecarReport {
        path: path.clone(),
        tables: Vec::new(),
    };
    let tables: Vec<String> = list_tables(&sidecar)?
        .into_iter()
        .filter(|t| is_sidecar_table(t))
        .collect();
    for table in tables.iter().filter(|t| *t != STATS_TABLE) {
        let entry = merge_rows(&sidecar, target, table, offsets)?;
        debug!("Sidecar {}: {}/{} rows", entry.table, entry.inserted, entry.read);
        report.tables.push(entry);
    }
    if tables.iter().any(|t| t == STATS_TABLE) {
        let share = report
            .tables
            .iter()
            .find(|t| t.table == TOKEN_TABLE)
            .filter(|t| t.read > 0)
            .map_or(1.0, |t| t.inserted as f64 / t.read as f64);
        let entry = merge_stats(&sidecar, target, share)?;
        debug!("Sidecar {}: {}/{} rows", entry.table, entry.inserted, entry.read);
        report.tables.push(entry);
    }
    Ok(Some(report))
}

/// Daily stats are added onto the unified row of the same date, scaled by
/// `share`: the fraction of the sidecar's `token_analysis` rows that were new
/// to the target. Nothing is added when no analysis row was new, so merging
/// the same sidecar twice counts it once.
fn merge_stats(
    sidecar: &Connection,
    target: &Connection,
    share: f64,
) -> Result<SidecarTable, MergeError> {
    let mut stmt = sidecar.prepare(
        "SELECT analysis_date, posts_analyzed, total_tokens, total_words, total_characters,
                processing_time_seconds
         FROM analysis_stats",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                BatchTotals {
                    posts: r.get::<_, i64>(1)?.max(0) as usize,
                    tokens: r.get::<_, i64>(2)?.max(0) as u64,
                    words: r.get::<_, i64>(3)?.max(0) as u64,
                    characters: r.get::<_, i64>(4)?.max(0) as u64,
                    processing_time_seconds: r.get(5)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut inserted = 0;
    let tx = target.unchecked_transaction()?;
    for (date, totals) in &rows {
        let totals = scale(totals, share);
        if totals.posts == 0 {
            continue;
        }
        store::add_daily_stats(&tx, date, &totals)?;
        inserted += 1;
    }
    tx.commit()?;
    Ok(SidecarTable {
        table: STATS_TABLE.to_string(),
        read: rows.len(),
        inserted,
    })
}

fn scale(totals: &BatchTotals, share: f64) -> BatchTotals {
    if share >= 1.0 {
        return totals.clone();
    }
    let part = |n: u64| (n as f64 * share).round() as u64;
    BatchTotals {
        posts: part(totals.posts as u64) as usize,
        tokens: part(totals.tokens),
        words: part(totals.words),
        characters: part(totals.characters),
        processing_time_seconds: totals.processing_time_seconds * share,
    }
}

/// Copy rows without their own `id`, shifting `post_id` and `user_id`.
fn merge_rows(
    sidecar: &Connection,
    target: &Connection,
    table: &str,
    offsets: &OffsetMap,
) -> Result<SidecarTable, MergeError> {
    let info = describe_table(sidecar, table)?;
    if !table_exists(target, table)? {
        target.execute_batch(&schema::create_table_sql(&info))?;
    }
    let target_cols = table_columns(target, table)?;
    let columns: Vec<String> = info
        .columns
        .iter()
        .map(|c| c.name.clone())
        .filter(|c| c != "id" && target_cols.iter().any(|t| &t.name == c))
        .collect();
    if columns.is_empty() {
        return Ok(SidecarTable {
            table: table.to_string(),
            ..SidecarTable::default()
        });
    }

    let shifts: Vec<(usize, i64)> = columns
        .iter()
        .enumerate()
        .filter_map(|(idx, c)| match c.as_str() {
            "post_id" => Some((idx, offsets.get("forum_posts"))),
            "user_id" => Some((idx, offsets.get("forum_users"))),
            _ => None,
        })
        .collect();

    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let select = format!("SELECT {} FROM {}", quoted.join(", "), quote_ident(table));
    let insert = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
        quote_ident(table),
        quoted.join(", "),
        vec!["?"; columns.len()].join(", ")
    );

    let mut read = 0;
    let mut inserted = 0;
    let tx = target.unchecked_transaction()?;
    {
        let mut src = sidecar.prepare(&select)?;
        let mut ins = tx.prepare(&insert)?;
        let mut rows = src.query([])?;
        while let Some(row) = rows.next()? {
            let mut values: Vec<Value> = (0..columns.len())
                .map(|i| row.get_ref(i).map(owned_value))
                .collect::<Result<_, _>>()?;
            for &(idx, offset) in &shifts {
                if let Value::Integer(v) = &mut values[idx] {
                    *v += offset;
                }
            }
            read += 1;
            inserted += ins.execute(params_from_iter(values))?;
        }
    }
    tx.commit()?;
    Ok(SidecarTable {
        table: table.to_string(),
        read,
        inserted,
    })
}
