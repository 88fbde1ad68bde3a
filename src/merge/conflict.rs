//! Natural-key collisions across sources: usernames get a source prefix and
//! every user row carries the source it came from.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::db::{quote_ident, table_exists};
use crate::merge::schema::table_columns;

pub const USERS_TABLE: &str = "forum_users";
pub const PROVENANCE_COLUMN: &str = "forum_id";
pub const USERNAME_COLUMN: &str = "username";

static SOURCE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^forum_(.+)\.db$").unwrap());

/// Name used for prefixes and provenance: the source's `spider_name`, else the
/// `<name>` of a `forum_<name>.db` file, else `unknown`.
pub fn source_name(conn: &Connection, path: &Path) -> String {
    if let Some(name) = spider_name(conn).ok().flatten() {
        return name;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| SOURCE_FILE_RE.captures(n))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn spider_name(conn: &Connection) -> rusqlite::Result<Option<String>> {
    if !table_exists(conn, "forums")? {
        return Ok(None);
    }
    let name: Option<Option<String>> = conn
        .query_row("SELECT spider_name FROM forums LIMIT 1", [], |r| r.get(0))
        .optional()?;
    Ok(name.flatten().filter(|n| !n.trim().is_empty()))
}

pub fn prefix_username(source: &str, username: &str) -> String {
    format!("{source}_{username}")
}

/// Add the provenance column to an existing users table that lacks it.
pub fn ensure_provenance_column(target: &Connection) -> rusqlite::Result<bool> {
    if !table_exists(target, USERS_TABLE)? {
        return Ok(false);
    }
    if table_columns(target, USERS_TABLE)?
        .iter()
        .any(|c| c.name == PROVENANCE_COLUMN)
    {
        return Ok(false);
    }
    target.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} TEXT",
        quote_ident(USERS_TABLE),
        quote_ident(PROVENANCE_COLUMN)
    ))?;
    info!("Added {} to {}", PROVENANCE_COLUMN, USERS_TABLE);
    Ok(true)
}

/// Insert layout for user rows: the source columns, plus the provenance
/// column when the source does not have one.
pub fn user_columns(source_columns: &[String]) -> (Vec<String>, bool) {
    let mut columns = source_columns.to_vec();
    let synthesized = !columns.iter().any(|c| c == PROVENANCE_COLUMN);
    if synthesized {
        columns.push(PROVENANCE_COLUMN.to_string());
    }
    (columns, synthesized)
}

/// Rewrite one user row in place. `columns` is the insert layout from
/// [`user_columns`]; a synthesized provenance value is appended and a NULL
/// one is filled in.
pub fn resolve_user_row(row: &mut Vec<Value>, columns: &[String], synthesized: bool, source: &str) {
    if synthesized {
        row.push(Value::Text(source.to_string()));
    } else if let Some(idx) = columns.iter().position(|c| c == PROVENANCE_COLUMN) {
        if let Some(value) = row.get_mut(idx) {
            if matches!(value, Value::Null) {
                *value = Value::Text(source.to_string());
            }
        }
    }
    if let Some(idx) = columns.iter().position(|c| c == USERNAME_COLUMN) {
        let prefixed = match row.get(idx) {
            Some(Value::Text(name)) if !name.is_empty() => Some(prefix_username(source, name)),
            _ => None,
        };
        if let Some(name) = prefixed {
            row[idx] = Value::Text(name);
        }
    }
}
