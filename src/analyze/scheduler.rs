//! Picks the next posts to analyze. Source rows are paged in primary-key
//! order and filtered against the analysis database, so a page never
//! includes a post that already has a row for the method.

use std::collections::{BTreeMap, HashSet};

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use super::record::AnalysisTask;
use super::store;

const FORUM_JOIN: &str = "FROM forum_posts p
     JOIN forum_threads t ON p.thread_id = t.id
     JOIN forum_sections s ON t.section_id = s.id
     JOIN forums f ON s.forum_id = f.id";

/// Forum names present in the unified database.
pub fn detect_forums(source: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = source.prepare(
        "SELECT DISTINCT spider_name FROM forums
         WHERE spider_name IS NOT NULL AND spider_name <> ''
         ORDER BY spider_name",
    )?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub tasks: Vec<AnalysisTask>,
    /// Highest post id examined; pass it back as `after_id` to continue.
    pub cursor: i64,
    /// No eligible source row exists past `cursor`.
    pub exhausted: bool,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn content_bytes(value: ValueRef<'_>) -> Vec<u8> {
    match value {
        ValueRef::Text(t) | ValueRef::Blob(t) => t.to_vec(),
        _ => Vec::new(),
    }
}

/// Up to `limit` posts with non-empty content, belonging to `forums`, with an
/// id above `after_id` and no analysis row for `method`.
pub fn scan_after(
    source: &Connection,
    analysis: &Connection,
    forums: &[String],
    method: &str,
    after_id: i64,
    limit: usize,
) -> rusqlite::Result<ScanPage> {
    let mut page = ScanPage {
        tasks: Vec::new(),
        cursor: after_id,
        exhausted: false,
    };
    if forums.is_empty() || limit == 0 {
        page.exhausted = forums.is_empty();
        return Ok(page);
    }

    let sql = format!(
        "SELECT p.id, p.content {FORUM_JOIN}
         WHERE p.id > ? AND p.content IS NOT NULL AND length(p.content) > 0
           AND f.spider_name IN ({})
         ORDER BY p.id
         LIMIT ?",
        placeholders(forums.len())
    );
    let mut stmt = source.prepare(&sql)?;

    while page.tasks.len() < limit {
        let mut args: Vec<Value> = Vec::with_capacity(forums.len() + 2);
        args.push(Value::Integer(page.cursor));
        args.extend(forums.iter().map(|f| Value::Text(f.clone())));
        args.push(Value::Integer(limit as i64));

        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(AnalysisTask::new(row.get(0)?, content_bytes(row.get_ref(1)?)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let fetched = rows.len();
        let Some(last) = rows.last().map(|t| t.post_id) else {
            page.exhausted = true;
            break;
        };

        let ids: Vec<i64> = rows.iter().map(|t| t.post_id).collect();
        let done = store::analyzed_among(analysis, method, &ids)?;
        let mut reached_end_of_page = true;
        for task in rows {
            if page.tasks.len() == limit {
                reached_end_of_page = false;
                break;
            }
            page.cursor = task.post_id;
            if !done.contains(&task.post_id) {
                page.tasks.push(task);
            }
        }
        if reached_end_of_page {
            page.cursor = last;
        }
        if fetched < limit {
            page.exhausted = reached_end_of_page;
            break;
        }
    }
    Ok(page)
}

/// Eligible post ids of `forums`, in id order.
fn eligible_ids(source: &Connection, forums: &[String]) -> rusqlite::Result<Vec<i64>> {
    if forums.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT p.id {FORUM_JOIN}
         WHERE p.content IS NOT NULL AND length(p.content) > 0
           AND f.spider_name IN ({})
         ORDER BY p.id",
        placeholders(forums.len())
    );
    let mut stmt = source.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(forums.iter()), |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCount {
    pub eligible: usize,
    pub pending: usize,
}

pub fn count_pending(
    source: &Connection,
    analysis: &Connection,
    forums: &[String],
    method: &str,
) -> rusqlite::Result<PendingCount> {
    let eligible = eligible_ids(source, forums)?;
    let done = store::analyzed_ids(analysis, method)?;
    let pending = eligible.iter().filter(|id| !done.contains(id)).count();
    Ok(PendingCount {
        eligible: eligible.len(),
        pending,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForumProgress {
    pub forum: String,
    pub total_posts: usize,
    pub analyzed_posts: usize,
    pub progress_percent: f64,
}

pub fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Posts and analyzed posts per forum.
pub fn forums_info(
    source: &Connection,
    analysis: &Connection,
    method: &str,
) -> rusqlite::Result<Vec<ForumProgress>> {
    let done: HashSet<i64> = store::analyzed_ids(analysis, method)?;
    let mut per_forum: BTreeMap<String, (usize, usize)> = detect_forums(source)?
        .into_iter()
        .map(|f| (f, (0, 0)))
        .collect();

    let sql = format!("SELECT f.spider_name, p.id {FORUM_JOIN} WHERE f.spider_name IS NOT NULL");
    let mut stmt = source.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let forum: String = row.get(0)?;
        let id: i64 = row.get(1)?;
        let entry = per_forum.entry(forum).or_default();
        entry.0 += 1;
        if done.contains(&id) {
            entry.1 += 1;
        }
    }

    Ok(per_forum
        .into_iter()
        .map(|(forum, (total, analyzed))| ForumProgress {
            forum,
            total_posts: total,
            analyzed_posts: analyzed,
            progress_percent: percent(analyzed, total),
        })
        .collect())
}
