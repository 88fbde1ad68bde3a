use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::db::table_exists;
use crate::merge::schema::{max_id, table_columns};

/// Per-table amount added to the ids of the source being merged. Built from
/// the target's current `MAX(id)` right before that source is merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OffsetMap {
    offsets: HashMap<String, i64>,
}

impl OffsetMap {
    /// No rewriting at all.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn compute<'a>(
        target: &Connection,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> rusqlite::Result<Self> {
        let mut offsets = HashMap::new();
        for table in tables {
            if !table_exists(target, table)? {
                continue;
            }
            if !table_columns(target, table)?.iter().any(|c| c.name == "id") {
                continue;
            }
            let max = max_id(target, table)?.unwrap_or(0);
            offsets.insert(table.to_string(), max);
        }
        Ok(Self { offsets })
    }

    pub fn get(&self, table: &str) -> i64 {
        self.offsets.get(table).copied().unwrap_or(0)
    }

    pub fn insert(&mut self, table: impl Into<String>, offset: i64) {
        self.offsets.insert(table.into(), offset);
    }

    pub fn is_identity(&self) -> bool {
        self.offsets.values().all(|&o| o == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_target_max_id() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE forums (id INTEGER PRIMARY KEY, spider_name TEXT);
             CREATE TABLE forum_posts (id INTEGER PRIMARY KEY, content TEXT);
             CREATE TABLE tags (post_id INTEGER, tag TEXT);
             INSERT INTO forums (id, spider_name) VALUES (1, 'a'), (7, 'b');",
        )
        .unwrap();
        let map = OffsetMap::compute(&conn, ["forums", "forum_posts", "tags", "missing"]).unwrap();
        assert_eq!(map.get("forums"), 7);
        assert_eq!(map.get("forum_posts"), 0);
        assert_eq!(map.get("tags"), 0);
        assert_eq!(map.get("missing"), 0);
        assert!(!map.is_identity());
        assert!(OffsetMap::identity().is_identity());
    }
}
