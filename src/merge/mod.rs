//! Merge per-source forum databases into one unified database.
//!
//! Sources are merged one at a time. Before each source the target's
//! `MAX(id)` per table becomes that source's offset, then tables are copied
//! parents first so every foreign key can be shifted by its parent's offset.

pub mod conflict;
pub mod offsets;
pub mod remap;
pub mod schema;
pub mod sidecar;

use std::path::{Path, PathBuf};
use std::time::Instant;

use globset::Glob;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::{self, owned_value, quote_ident, table_exists};
use crate::error::MergeError;
use conflict::USERS_TABLE;
use offsets::OffsetMap;
use remap::{OrphanCount, RowPlan};
use schema::TableInfo;
use sidecar::SidecarReport;

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub target: PathBuf,
    /// Shift ids by the target's current maxima. Without it colliding rows
    /// are silently dropped.
    pub use_offsets: bool,
    /// Delete the target before merging.
    pub recreate: bool,
    pub batch_size: usize,
    /// Where sidecar analysis rows go; the target itself when unset.
    /// [`crate::config::Settings::merge_options`] points it at the analyzer's
    /// database.
    pub analysis_target: Option<PathBuf>,
    pub show_progress: bool,
}

impl MergeOptions {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            use_offsets: true,
            recreate: true,
            batch_size: 1000,
            analysis_target: None,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub offset: i64,
    pub read: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub path: PathBuf,
    pub name: String,
    pub tables: Vec<TableReport>,
    pub sidecar: Option<SidecarReport>,
    pub sidecar_error: Option<String>,
}

impl SourceReport {
    pub fn rows_inserted(&self) -> usize {
        self.tables.iter().map(|t| t.inserted).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub path: PathBuf,
    pub table: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub target: PathBuf,
    pub use_offsets: bool,
    pub sources: Vec<SourceReport>,
    pub failures: Vec<SourceFailure>,
    pub integrity: Vec<OrphanCount>,
    pub elapsed_secs: f64,
}

impl MergeReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn orphans(&self) -> i64 {
        self.integrity.iter().map(|o| o.orphans).sum()
    }
}

/// Per-source databases in `dir` matching `pattern`, sorted by name.
/// Merged outputs, analysis sidecars and `exclude` are skipped.
pub fn find_sources(dir: &Path, pattern: &str, exclude: Option<&Path>) -> Result<Vec<PathBuf>, MergeError> {
    let matcher = Glob::new(pattern)?.compile_matcher();
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !matcher.is_match(name) || name.starts_with("merged_") || name.ends_with("_analysis.db") {
            continue;
        }
        if exclude.is_some_and(|e| same_file(e, &path)) {
            continue;
        }
        found.push(path);
    }
    found.sort();
    debug!("Found {} source databases in {}", found.len(), dir.display());
    Ok(found)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStructure {
    pub path: PathBuf,
    pub name: String,
    pub tables: Vec<TableInfo>,
}

/// Introspect every source without writing anything.
pub fn dry_run(sources: &[PathBuf]) -> Result<Vec<SourceStructure>, MergeError> {
    sources
        .iter()
        .map(|path| {
            let conn = open_source(path)?;
            Ok(SourceStructure {
                path: path.clone(),
                name: conflict::source_name(&conn, path),
                tables: schema::introspect(&conn)?,
            })
        })
        .collect()
}

/// Open the target per `options` and merge `sources` into it.
pub fn merge(sources: &[PathBuf], options: MergeOptions) -> Result<MergeReport, MergeError> {
    Merger::open(options)?.merge(sources)
}

fn open_source(path: &Path) -> Result<Connection, MergeError> {
    if !path.is_file() {
        return Err(MergeError::SourceNotFound(path.to_path_buf()));
    }
    Ok(db::connect_read_only(path)?)
}

pub struct Merger {
    options: MergeOptions,
    target: Connection,
    analysis: Option<Connection>,
}

impl Merger {
    /// Open (and by default re-create) the target.
    pub fn open(options: MergeOptions) -> Result<Self, MergeError> {
        if let Some(dir) = options.target.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        if options.recreate {
            info!("Re-creating {}", options.target.display());
            db::remove_database(&options.target)?;
        }
        let target = db::connect_target(&options.target)?;
        let analysis = match &options.analysis_target {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)?;
                }
                Some(db::connect(path)?)
            }
            None => None,
        };
        Ok(Self {
            options,
            target,
            analysis,
        })
    }

    pub fn target(&self) -> &Connection {
        &self.target
    }

    /// Create the target tables from the first source that exists.
    fn prepare_target(&self, sources: &[PathBuf]) -> Result<(), MergeError> {
        let first = sources
            .iter()
            .find(|p| p.is_file())
            .ok_or_else(|| MergeError::SourceNotFound(sources[0].clone()))?;
        let conn = open_source(first)?;
        let tables = schema::introspect(&conn)?;
        schema::ensure_target_tables(&self.target, &tables)?;
        conflict::ensure_provenance_column(&self.target)?;
        let indexes = schema::create_indexes(&self.target)?;
        info!(
            "Target schema from {}: {} tables, {} indexes",
            first.display(),
            tables.len(),
            indexes
        );
        Ok(())
    }

    /// Merge `sources` in order. A failing source is rolled back and reported
    /// in `failures`; the remaining sources are still merged.
    pub fn merge(&self, sources: &[PathBuf]) -> Result<MergeReport, MergeError> {
        if sources.is_empty() {
            return Err(MergeError::NoSources);
        }
        let t0 = Instant::now();
        self.prepare_target(sources)?;

        let mut report = MergeReport {
            target: self.options.target.clone(),
            use_offsets: self.options.use_offsets,
            sources: Vec::new(),
            failures: Vec::new(),
            integrity: Vec::new(),
            elapsed_secs: 0.0,
        };
        if !self.options.use_offsets {
            warn!("Merging without id offsets: rows with colliding ids are dropped");
        }

        let pb = self.progress_bar(sources.len() as u64);
        for path in sources {
            pb.set_message(path.display().to_string());
            match self.merge_source(path) {
                Ok(source_report) => {
                    info!(
                        "Merged {} ({}): {} rows",
                        source_report.name,
                        path.display(),
                        source_report.rows_inserted()
                    );
                    report.sources.push(source_report);
                }
                Err(e) => {
                    error!("Failed to merge {}: {}", path.display(), e);
                    report.failures.push(SourceFailure {
                        path: path.clone(),
                        table: e.table().map(str::to_string),
                        error: e.to_string(),
                    });
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        report.integrity = remap::verify_integrity(&self.target)?;
        if report.orphans() > 0 {
            warn!("{} foreign keys without a parent row", report.orphans());
        }
        report.elapsed_secs = t0.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Merge one source inside a single transaction, then its sidecar.
    pub fn merge_source(&self, path: &Path) -> Result<SourceReport, MergeError> {
        let source = open_source(path)?;
        let name = conflict::source_name(&source, path);
        let order = remap::merge_order(&schema::list_tables(&source)?);
        let tables = order
            .iter()
            .map(|t| schema::describe_table(&source, t))
            .collect::<Result<Vec<_>, _>>()?;

        let offsets = if self.options.use_offsets {
            OffsetMap::compute(&self.target, order.iter().map(String::as_str))?
        } else {
            OffsetMap::identity()
        };
        debug!("Offsets for {}: {:?}", name, offsets);

        let tx = self.target.unchecked_transaction()?;
        schema::ensure_target_tables(&tx, &tables)?;
        schema::create_indexes(&tx)?;
        let mut table_reports = Vec::with_capacity(tables.len());
        for table in &tables {
            let table_report = copy_table(&source, &tx, table, &name, &offsets, self.options.batch_size)
                .map_err(|error| MergeError::Table {
                    source_name: name.clone(),
                    table: table.name.clone(),
                    error,
                })?;
            if table_report.inserted < table_report.read {
                warn!(
                    "{}.{}: {} of {} rows skipped as duplicates",
                    name,
                    table.name,
                    table_report.read - table_report.inserted,
                    table_report.read
                );
            }
            table_reports.push(table_report);
        }
        tx.commit()?;

        let mut report = SourceReport {
            path: path.to_path_buf(),
            name,
            tables: table_reports,
            sidecar: None,
            sidecar_error: None,
        };
        let analysis = self.analysis.as_ref().unwrap_or(&self.target);
        match sidecar::merge_sidecar(path, analysis, &offsets) {
            Ok(found) => report.sidecar = found,
            Err(e) => {
                warn!("Sidecar merge for {} failed: {}", report.name, e);
                report.sidecar_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb
    }
}

/// Copy every row of one table, remapped, in batches of `batch_size`.
fn copy_table(
    source: &Connection,
    target: &Connection,
    table: &TableInfo,
    source_name: &str,
    offsets: &OffsetMap,
    batch_size: usize,
) -> rusqlite::Result<TableReport> {
    let source_columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
    let is_users = table.name == USERS_TABLE;
    let (columns, synthesized) = if is_users {
        conflict::user_columns(&source_columns)
    } else {
        (source_columns.clone(), false)
    };
    let plan = RowPlan::new(&table.name, &columns, offsets);

    let select_cols: Vec<String> = source_columns.iter().map(|c| quote_ident(c)).collect();
    let order_by = if table.has_column("id") { " ORDER BY \"id\"" } else { "" };
    let select = format!(
        "SELECT {} FROM {}{}",
        select_cols.join(", "),
        quote_ident(&table.name),
        order_by
    );
    let insert_cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let insert = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
        quote_ident(&table.name),
        insert_cols.join(", "),
        vec!["?"; columns.len()].join(", ")
    );

    let mut report = TableReport {
        table: table.name.clone(),
        offset: offsets.get(&table.name),
        read: 0,
        inserted: 0,
    };
    let mut stmt = source.prepare(&select)?;
    let mut ins = target.prepare(&insert)?;
    let mut rows = stmt.query([])?;
    let batch_size = batch_size.max(1);
    let mut batch: Vec<Vec<Value>> = Vec::with_capacity(batch_size);
    loop {
        let row = rows.next()?;
        if let Some(row) = row {
            let mut values = (0..source_columns.len())
                .map(|i| row.get_ref(i).map(owned_value))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if is_users {
                conflict::resolve_user_row(&mut values, &columns, synthesized, source_name);
            }
            plan.apply(&mut values);
            batch.push(values);
            if batch.len() < batch_size {
                continue;
            }
        }
        if batch.is_empty() {
            break;
        }
        report.read += batch.len();
        for values in batch.drain(..) {
            report.inserted += ins.execute(params_from_iter(values))?;
        }
        debug!("{}.{}: {} rows written", source_name, table.name, report.inserted);
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForumCounts {
    pub id: i64,
    pub spider_name: Option<String>,
    pub sections: i64,
    pub posts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalStatistics {
    pub table_counts: Vec<(String, i64)>,
    pub forums: Vec<ForumCounts>,
    /// Users per provenance value.
    pub users_by_source: Vec<(Option<String>, i64)>,
    /// Expected to be empty after a merge with prefixed usernames.
    pub duplicate_usernames: Vec<(String, i64)>,
}

/// Row counts and the consistency checks printed after a merge.
pub fn final_statistics(conn: &Connection) -> rusqlite::Result<FinalStatistics> {
    let mut stats = FinalStatistics {
        table_counts: Vec::new(),
        forums: Vec::new(),
        users_by_source: Vec::new(),
        duplicate_usernames: Vec::new(),
    };
    for table in remap::merge_order(&schema::list_tables(conn)?) {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(&table)), [], |r| {
            r.get(0)
        })?;
        stats.table_counts.push((table, n));
    }

    let hierarchy = ["forums", "forum_sections", "forum_threads", "forum_posts"];
    let mut has_hierarchy = true;
    for t in hierarchy {
        has_hierarchy &= table_exists(conn, t)?;
    }
    if has_hierarchy {
        let mut stmt = conn.prepare(
            "SELECT f.id, f.spider_name, COUNT(DISTINCT fs.id), COUNT(DISTINCT fp.id)
             FROM forums f
             LEFT JOIN forum_sections fs ON f.id = fs.forum_id
             LEFT JOIN forum_threads ft ON fs.id = ft.section_id
             LEFT JOIN forum_posts fp ON ft.id = fp.thread_id
             GROUP BY f.id, f.spider_name
             ORDER BY f.id",
        )?;
        stats.forums = stmt
            .query_map([], |r| {
                Ok(ForumCounts {
                    id: r.get(0)?,
                    spider_name: r.get(1)?,
                    sections: r.get(2)?,
                    posts: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }

    if table_exists(conn, USERS_TABLE)? {
        let columns = schema::table_columns(conn, USERS_TABLE)?;
        if columns.iter().any(|c| c.name == conflict::PROVENANCE_COLUMN) {
            let mut stmt = conn.prepare(
                "SELECT forum_id, COUNT(*) FROM forum_users GROUP BY forum_id ORDER BY forum_id",
            )?;
            stats.users_by_source = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
        }
        if columns.iter().any(|c| c.name == conflict::USERNAME_COLUMN) {
            let mut stmt = conn.prepare(
                "SELECT username, COUNT(*) AS n FROM forum_users
                 WHERE username IS NOT NULL
                 GROUP BY username HAVING n > 1
                 ORDER BY n DESC, username
                 LIMIT 20",
            )?;
            stats.duplicate_usernames = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
        }
    }
    Ok(stats)
}
