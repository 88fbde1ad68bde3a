//! Primary and foreign key rewriting along the fixed forum hierarchy.

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;

use super::offsets::OffsetMap;
use super::schema::table_columns;
use crate::db::{quote_ident, table_exists};

/// Tables merged first, parents before children.
pub const DEPENDENCY_ORDER: &[&str] = &[
    "forums",
    "forum_sections",
    "forum_threads",
    "forum_users",
    "forum_posts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForeignKeyEdge {
    pub child_table: &'static str,
    pub child_column: &'static str,
    pub parent_table: &'static str,
}

pub const FK_EDGES: &[ForeignKeyEdge] = &[
    ForeignKeyEdge {
        child_table: "forum_sections",
        child_column: "forum_id",
        parent_table: "forums",
    },
    ForeignKeyEdge {
        child_table: "forum_threads",
        child_column: "section_id",
        parent_table: "forum_sections",
    },
    ForeignKeyEdge {
        child_table: "forum_posts",
        child_column: "thread_id",
        parent_table: "forum_threads",
    },
    ForeignKeyEdge {
        child_table: "forum_posts",
        child_column: "user_id",
        parent_table: "forum_users",
    },
];

pub fn edges_of(table: &str) -> impl Iterator<Item = &'static ForeignKeyEdge> + '_ {
    FK_EDGES.iter().filter(move |e| e.child_table == table)
}

/// Merge order: the hierarchy first, then any other table by name.
pub fn merge_order<S: AsRef<str>>(tables: &[S]) -> Vec<String> {
    let mut ordered: Vec<String> = DEPENDENCY_ORDER
        .iter()
        .filter(|t| tables.iter().any(|x| x.as_ref() == **t))
        .map(|t| t.to_string())
        .collect();
    let mut rest: Vec<String> = tables
        .iter()
        .map(|t| t.as_ref().to_string())
        .filter(|t| !DEPENDENCY_ORDER.contains(&t.as_str()))
        .collect();
    rest.sort();
    ordered.extend(rest);
    ordered
}

/// Where the offsets of one table's rows go: its own `id` and each
/// foreign-key column, by position in the row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPlan {
    shifts: Vec<(usize, i64)>,
}

impl RowPlan {
    pub fn new(table: &str, columns: &[String], offsets: &OffsetMap) -> Self {
        let mut shifts = Vec::new();
        if let Some(idx) = columns.iter().position(|c| c == "id") {
            shifts.push((idx, offsets.get(table)));
        }
        for edge in edges_of(table) {
            if let Some(idx) = columns.iter().position(|c| c == edge.child_column) {
                shifts.push((idx, offsets.get(edge.parent_table)));
            }
        }
        shifts.retain(|&(_, offset)| offset != 0);
        Self { shifts }
    }

    /// Shift integer keys in place. NULL and non-integer keys stay as they are.
    pub fn apply(&self, row: &mut [Value]) {
        for &(idx, offset) in &self.shifts {
            if let Some(Value::Integer(v)) = row.get_mut(idx) {
                *v += offset;
            }
        }
    }

    pub fn is_noop(&self) -> bool {
        self.shifts.is_empty()
    }
}

/// Child rows of one edge whose non-NULL key has no parent row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanCount {
    pub edge: ForeignKeyEdge,
    pub orphans: i64,
}

/// Count dangling foreign keys for every edge present in `conn`.
pub fn verify_integrity(conn: &Connection) -> rusqlite::Result<Vec<OrphanCount>> {
    let mut out = Vec::new();
    for edge in FK_EDGES {
        if !table_exists(conn, edge.child_table)? || !table_exists(conn, edge.parent_table)? {
            continue;
        }
        if !table_columns(conn, edge.child_table)?
            .iter()
            .any(|c| c.name == edge.child_column)
        {
            continue;
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {child} c
             WHERE c.{col} IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.id = c.{col})",
            child = quote_ident(edge.child_table),
            col = quote_ident(edge.child_column),
            parent = quote_ident(edge.parent_table),
        );
        let orphans = conn.query_row(&sql, [], |r| r.get(0))?;
        out.push(OrphanCount {
            edge: *edge,
            orphans,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hierarchy_first_then_by_name() {
        let order = merge_order(&["zeta", "forum_posts", "forums", "alpha", "forum_users"]);
        assert_eq!(order, vec!["forums", "forum_users", "forum_posts", "alpha", "zeta"]);
    }

    #[test]
    fn post_row_is_shifted_by_own_and_parent_offsets() {
        let mut offsets = OffsetMap::identity();
        offsets.insert("forum_posts", 100);
        offsets.insert("forum_threads", 10);
        offsets.insert("forum_users", 5);
        let plan = RowPlan::new(
            "forum_posts",
            &cols(&["id", "thread_id", "user_id", "content"]),
            &offsets,
        );
        let mut row = vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Null,
            Value::Text("hi".into()),
        ];
        plan.apply(&mut row);
        assert_eq!(
            row,
            vec![
                Value::Integer(101),
                Value::Integer(12),
                Value::Null,
                Value::Text("hi".into())
            ]
        );
    }

    #[test]
    fn other_tables_only_shift_their_id() {
        let mut offsets = OffsetMap::identity();
        offsets.insert("tags", 3);
        offsets.insert("forum_threads", 10);
        let plan = RowPlan::new("tags", &cols(&["id", "thread_id"]), &offsets);
        let mut row = vec![Value::Integer(1), Value::Integer(1)];
        plan.apply(&mut row);
        assert_eq!(row, vec![Value::Integer(4), Value::Integer(1)]);
    }

    #[test]
    fn counts_dangling_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE forums (id INTEGER PRIMARY KEY);
             CREATE TABLE forum_sections (id INTEGER PRIMARY KEY, forum_id INTEGER);
             INSERT INTO forums VALUES (1);
             INSERT INTO forum_sections VALUES (1, 1), (2, 9), (3, NULL);",
        )
        .unwrap();
        let found = verify_integrity(&conn).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].edge.child_table, "forum_sections");
        assert_eq!(found[0].orphans, 1);
    }

    #[test]
    fn identity_offsets_are_a_noop() {
        let plan = RowPlan::new("forum_posts", &cols(&["id", "thread_id"]), &OffsetMap::identity());
        assert!(plan.is_noop());
    }
}
