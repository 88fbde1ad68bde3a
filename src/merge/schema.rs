//! Table and column introspection, and target schema creation.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::{quote_ident, table_exists};
use crate::error::MergeError;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Indexes of the unified database: (name, table, column).
pub const TARGET_INDEXES: &[(&str, &str, &str)] = &[
    ("idx_forum_posts_user_id", "forum_posts", "user_id"),
    ("idx_forum_posts_thread_id", "forum_posts", "thread_id"),
    ("idx_forum_threads_section_id", "forum_threads", "section_id"),
    ("idx_forum_sections_forum_id", "forum_sections", "forum_id"),
    ("idx_forum_users_username", "forum_users", "username"),
    ("idx_forum_users_forum_id", "forum_users", "forum_id"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position in the primary key, 0 when not part of it.
    pub pk: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: i64,
    pub max_id: Option<i64>,
}

impl TableInfo {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// Table names must be plain identifiers before they are spliced into SQL.
pub fn validate_ident(table: &str, name: &str) -> Result<(), MergeError> {
    if IDENT_RE.is_match(name) {
        Ok(())
    } else {
        Err(MergeError::SchemaConflict {
            table: table.to_string(),
            detail: format!("unsupported identifier {name:?}"),
        })
    }
}

pub fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(3)? != 0,
                default: row.get(4)?,
                pk: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn max_id(conn: &Connection, table: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        &format!("SELECT MAX(id) FROM {}", quote_ident(table)),
        [],
        |r| r.get(0),
    )
}

pub fn describe_table(conn: &Connection, table: &str) -> Result<TableInfo, MergeError> {
    validate_ident(table, table)?;
    let columns = table_columns(conn, table)?;
    for c in &columns {
        validate_ident(table, &c.name)?;
    }
    let row_count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |r| r.get(0),
    )?;
    let max_id = if columns.iter().any(|c| c.name == "id") {
        max_id(conn, table)?
    } else {
        None
    };
    Ok(TableInfo {
        name: table.to_string(),
        columns,
        row_count,
        max_id,
    })
}

/// Every user table of a database.
pub fn introspect(conn: &Connection) -> Result<Vec<TableInfo>, MergeError> {
    list_tables(conn)?
        .iter()
        .map(|t| describe_table(conn, t))
        .collect()
}

fn column_def(c: &ColumnInfo, single_pk: bool) -> String {
    let mut def = quote_ident(&c.name);
    if !c.decl_type.is_empty() {
        def.push(' ');
        def.push_str(&c.decl_type);
    }
    if single_pk && c.pk > 0 {
        def.push_str(" PRIMARY KEY");
    }
    if c.not_null && !(single_pk && c.pk > 0) {
        def.push_str(" NOT NULL");
    }
    if let Some(d) = &c.default {
        def.push_str(" DEFAULT ");
        def.push_str(d);
    }
    def
}

/// `CREATE TABLE` for a copy of `table`, plus the provenance column on
/// `forum_users`.
pub fn create_table_sql(table: &TableInfo) -> String {
    let mut pk_cols: Vec<&ColumnInfo> = table.columns.iter().filter(|c| c.pk > 0).collect();
    pk_cols.sort_by_key(|c| c.pk);
    let single_pk = pk_cols.len() == 1;

    let mut defs: Vec<String> = table.columns.iter().map(|c| column_def(c, single_pk)).collect();
    if table.name == super::conflict::USERS_TABLE && !table.has_column(super::conflict::PROVENANCE_COLUMN) {
        defs.push(format!("{} TEXT", quote_ident(super::conflict::PROVENANCE_COLUMN)));
    }
    if pk_cols.len() > 1 {
        let names: Vec<String> = pk_cols.iter().map(|c| quote_ident(&c.name)).collect();
        defs.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.name),
        defs.join(", ")
    )
}

/// Create missing target tables from the source layout. An existing table
/// must already carry every source column.
pub fn ensure_target_tables(target: &Connection, tables: &[TableInfo]) -> Result<(), MergeError> {
    for table in tables {
        if table_exists(target, &table.name)? {
            let existing = table_columns(target, &table.name)?;
            if let Some(missing) = table
                .columns
                .iter()
                .find(|c| !existing.iter().any(|e| e.name == c.name))
            {
                return Err(MergeError::SchemaConflict {
                    table: table.name.clone(),
                    detail: format!("target has no column {}", missing.name),
                });
            }
            debug!("Table {} already present", table.name);
        } else {
            target.execute_batch(&create_table_sql(table))?;
            info!("Created table {}", table.name);
        }
    }
    Ok(())
}

/// Build the lookup indexes for every indexed table that exists.
pub fn create_indexes(target: &Connection) -> rusqlite::Result<usize> {
    let mut created = 0;
    for (name, table, column) in TARGET_INDEXES {
        if !table_exists(target, table)? {
            continue;
        }
        if !table_columns(target, table)?.iter().any(|c| c.name == *column) {
            continue;
        }
        target.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            quote_ident(name),
            quote_ident(table),
            quote_ident(column)
        ))?;
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE forums (id INTEGER PRIMARY KEY AUTOINCREMENT, spider_name TEXT NOT NULL, title TEXT);
             CREATE TABLE forum_users (id INTEGER PRIMARY KEY, username TEXT UNIQUE, posts_count INTEGER DEFAULT 0);
             CREATE TABLE tags (post_id INTEGER, tag TEXT, PRIMARY KEY (post_id, tag));
             INSERT INTO forums (spider_name) VALUES ('a'), ('b');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn introspects_counts_and_max_id() {
        let tables = introspect(&source()).unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["forum_users", "forums", "tags"]);
        let forums = &tables[1];
        assert_eq!(forums.row_count, 2);
        assert_eq!(forums.max_id, Some(2));
        assert_eq!(tables[2].max_id, None);
    }

    #[test]
    fn copies_layout_and_adds_provenance() {
        let src = source();
        let tables = introspect(&src).unwrap();
        let target = Connection::open_in_memory().unwrap();
        ensure_target_tables(&target, &tables).unwrap();

        let users = table_columns(&target, "forum_users").unwrap();
        assert!(users.iter().any(|c| c.name == "forum_id"));
        let id = users.iter().find(|c| c.name == "id").unwrap();
        assert_eq!(id.pk, 1);

        let tags = table_columns(&target, "tags").unwrap();
        assert_eq!(tags.iter().filter(|c| c.pk > 0).count(), 2);

        let forums = table_columns(&target, "forums").unwrap();
        assert!(forums.iter().find(|c| c.name == "spider_name").unwrap().not_null);

        assert_eq!(create_indexes(&target).unwrap(), 2);
    }

    #[test]
    fn existing_table_missing_column_conflicts() {
        let tables = introspect(&source()).unwrap();
        let target = Connection::open_in_memory().unwrap();
        target
            .execute_batch("CREATE TABLE forums (id INTEGER PRIMARY KEY, spider_name TEXT)")
            .unwrap();
        let err = ensure_target_tables(&target, &tables).unwrap_err();
        assert_eq!(err.table(), Some("forums"));
    }

    #[test]
    fn rejects_odd_identifiers() {
        assert!(validate_ident("t", "forum_posts").is_ok());
        assert!(validate_ident("t", "bad name").is_err());
        assert!(validate_ident("t", "1abc").is_err());
    }
}
