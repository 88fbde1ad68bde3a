use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use forumdb::analyze::Analyzer;
use forumdb::config::Settings;
use forumdb::error::MergeError;
use forumdb::merge::{self, MergeOptions, Merger};

struct Forum<'a> {
    name: &'a str,
    users: &'a [&'a str],
    /// (thread index, user index or None, content)
    posts: &'a [(usize, Option<usize>, &'a str)],
    threads: usize,
}

fn create_source(dir: &Path, file: &str, forum: &Forum, with_provenance: bool) -> PathBuf {
    let path = dir.join(file);
    let conn = Connection::open(&path).unwrap();
    let provenance = if with_provenance { ", forum_id TEXT" } else { "" };
    conn.execute_batch(&format!(
        "CREATE TABLE forums (id INTEGER PRIMARY KEY AUTOINCREMENT, spider_name TEXT NOT NULL,
             title TEXT, created_at TEXT DEFAULT CURRENT_TIMESTAMP, updated_at TEXT);
         CREATE TABLE forum_sections (id INTEGER PRIMARY KEY AUTOINCREMENT, forum_id INTEGER,
             title TEXT, url TEXT);
         CREATE TABLE forum_threads (id INTEGER PRIMARY KEY AUTOINCREMENT, section_id INTEGER,
             title TEXT, url TEXT);
         CREATE TABLE forum_users (id INTEGER PRIMARY KEY AUTOINCREMENT, username TEXT UNIQUE,
             join_date TEXT, posts_count INTEGER DEFAULT 0{provenance});
         CREATE TABLE forum_posts (id INTEGER PRIMARY KEY AUTOINCREMENT, thread_id INTEGER,
             user_id INTEGER, content TEXT, post_date TEXT);"
    ))
    .unwrap();

    conn.execute(
        "INSERT INTO forums (spider_name, title) VALUES (?1, ?2)",
        params![forum.name, format!("Forum {}", forum.name)],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO forum_sections (forum_id, title, url) VALUES (1, 'General', '/general')",
        [],
    )
    .unwrap();
    for t in 0..forum.threads {
        conn.execute(
            "INSERT INTO forum_threads (section_id, title, url) VALUES (1, ?1, ?2)",
            params![format!("thread {t}"), format!("/t/{t}")],
        )
        .unwrap();
    }
    for u in forum.users {
        conn.execute(
            "INSERT INTO forum_users (username, join_date) VALUES (?1, '2020-01-01')",
            [u],
        )
        .unwrap();
    }
    for (thread, user, content) in forum.posts {
        conn.execute(
            "INSERT INTO forum_posts (thread_id, user_id, content, post_date)
             VALUES (?1, ?2, ?3, '2021-05-05')",
            params![*thread as i64 + 1, user.map(|u| u as i64 + 1), content],
        )
        .unwrap();
    }
    path
}

fn simple(name: &'static str, user: &'static [&'static str]) -> Forum<'static> {
    Forum {
        name,
        users: user,
        posts: &[(0, Some(0), "hello from the forum")],
        threads: 1,
    }
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}

fn options(target: &Path) -> MergeOptions {
    MergeOptions::new(target)
}

#[test]
fn two_sources_get_distinct_ids_and_prefixed_users() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_src1.db", &simple("src1", &["alice"]), false);
    let b = create_source(dir.path(), "forum_src2.db", &simple("src2", &["bob"]), false);
    let target = dir.path().join("merged_forums.db");

    let report = merge::merge(&[a, b], options(&target)).unwrap();
    assert!(report.is_success());
    assert_eq!(report.sources.len(), 2);
    assert_eq!(report.orphans(), 0);

    let conn = Connection::open(&target).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forums"), 2);
    let mut names: Vec<String> = conn
        .prepare("SELECT username FROM forum_users ORDER BY username")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    names.sort();
    assert_eq!(names, vec!["src1_alice", "src2_bob"]);

    // each post reaches its own forum and its own user
    let resolved = count(
        &conn,
        "SELECT COUNT(*) FROM forum_posts p
         JOIN forum_threads t ON p.thread_id = t.id
         JOIN forum_sections s ON t.section_id = s.id
         JOIN forums f ON s.forum_id = f.id
         JOIN forum_users u ON p.user_id = u.id
         WHERE u.forum_id = f.spider_name
           AND u.username = f.spider_name || '_' || CASE f.spider_name WHEN 'src1' THEN 'alice' ELSE 'bob' END",
    );
    assert_eq!(resolved, 2);

    let second = &report.sources[1];
    let posts = second.tables.iter().find(|t| t.table == "forum_posts").unwrap();
    assert_eq!(posts.offset, 1);
    assert_eq!((posts.read, posts.inserted), (1, 1));
}

#[test]
fn provenance_column_is_added_and_filled() {
    let dir = tempfile::tempdir().unwrap();
    let src = create_source(dir.path(), "forum_wiara.db", &simple("wiara", &["jan", "anna"]), false);
    let target = dir.path().join("merged.db");

    merge::merge(&[src], options(&target)).unwrap();

    let conn = Connection::open(&target).unwrap();
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM forum_users WHERE forum_id = 'wiara'"),
        2
    );
    let stats = merge::final_statistics(&conn).unwrap();
    assert_eq!(stats.users_by_source, vec![(Some("wiara".to_string()), 2)]);
    assert!(stats.duplicate_usernames.is_empty());
}

#[test]
fn existing_provenance_values_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let src = create_source(dir.path(), "forum_x.db", &simple("x", &["ola"]), true);
    Connection::open(&src)
        .unwrap()
        .execute("UPDATE forum_users SET forum_id = 'legacy'", [])
        .unwrap();
    let target = dir.path().join("merged.db");

    merge::merge(&[src], options(&target)).unwrap();
    let conn = Connection::open(&target).unwrap();
    let value: String = conn
        .query_row("SELECT forum_id FROM forum_users", [], |r| r.get(0))
        .unwrap();
    assert_eq!(value, "legacy");
}

#[test]
fn many_sources_keep_keys_unique_and_resolvable() {
    let dir = tempfile::tempdir().unwrap();
    let posts: &[(usize, Option<usize>, &str)] = &[
        (0, Some(0), "first"),
        (1, Some(1), "second"),
        (2, None, "guest post"),
        (1, Some(2), "third"),
        (0, Some(0), ""),
    ];
    let mut sources = Vec::new();
    for i in 0..4 {
        let name = format!("f{i}");
        let forum = Forum {
            name: &name,
            users: &["u1", "u2", "u3"],
            posts,
            threads: 3,
        };
        sources.push(create_source(dir.path(), &format!("forum_f{i}.db"), &forum, i % 2 == 0));
    }
    let target = dir.path().join("merged.db");
    let report = merge::merge(&sources, options(&target)).unwrap();
    assert!(report.is_success());
    assert_eq!(report.orphans(), 0);

    let conn = Connection::open(&target).unwrap();
    for table in ["forums", "forum_sections", "forum_threads", "forum_users", "forum_posts"] {
        let total = count(&conn, &format!("SELECT COUNT(*) FROM {table}"));
        let distinct = count(&conn, &format!("SELECT COUNT(DISTINCT id) FROM {table}"));
        assert_eq!(total, distinct, "{table}");
    }
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forum_posts"), 20);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forum_users"), 12);
    assert!(merge::remap::verify_integrity(&conn)
        .unwrap()
        .iter()
        .all(|o| o.orphans == 0));

    let stats = merge::final_statistics(&conn).unwrap();
    assert_eq!(stats.forums.len(), 4);
    assert!(stats.forums.iter().all(|f| f.sections == 1 && f.posts == 5));
    assert!(stats.duplicate_usernames.is_empty());
}

fn content_rows(target: &Path) -> Vec<(String, String, String)> {
    let conn = Connection::open(target).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT f.spider_name, u.username, p.content FROM forum_posts p
             JOIN forum_threads t ON p.thread_id = t.id
             JOIN forum_sections s ON t.section_id = s.id
             JOIN forums f ON s.forum_id = f.id
             JOIN forum_users u ON p.user_id = u.id
             ORDER BY p.content",
        )
        .unwrap();
    let rows = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

#[test]
fn single_source_content_is_the_same_with_or_without_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let forum = Forum {
        name: "solo",
        users: &["a", "b"],
        posts: &[(0, Some(0), "one"), (0, Some(1), "two"), (1, Some(0), "three")],
        threads: 2,
    };
    let src = create_source(dir.path(), "forum_solo.db", &forum, false);

    let with = dir.path().join("with.db");
    let without = dir.path().join("without.db");
    merge::merge(std::slice::from_ref(&src), options(&with)).unwrap();
    let mut opts = options(&without);
    opts.use_offsets = false;
    merge::merge(&[src], opts).unwrap();

    let rows = content_rows(&with);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows, content_rows(&without));
}

#[test]
fn without_offsets_colliding_rows_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    let b = create_source(dir.path(), "forum_b.db", &simple("b", &["y"]), false);
    let target = dir.path().join("merged.db");
    let mut opts = options(&target);
    opts.use_offsets = false;

    let report = merge::merge(&[a, b], opts).unwrap();
    assert!(report.is_success());
    let forums = report.sources[1].tables.iter().find(|t| t.table == "forums").unwrap();
    assert_eq!((forums.read, forums.inserted), (1, 0));

    let conn = Connection::open(&target).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forums"), 1);
}

#[test]
fn failing_source_is_rolled_back_and_others_merge() {
    let dir = tempfile::tempdir().unwrap();
    let good1 = create_source(dir.path(), "forum_g1.db", &simple("g1", &["a"]), false);
    let bad = create_source(dir.path(), "forum_bad.db", &simple("bad", &["b"]), false);
    Connection::open(&bad)
        .unwrap()
        .execute_batch("ALTER TABLE forum_posts ADD COLUMN extra TEXT;")
        .unwrap();
    let missing = dir.path().join("forum_missing.db");
    let good2 = create_source(dir.path(), "forum_g2.db", &simple("g2", &["c"]), false);
    let target = dir.path().join("merged.db");

    let report = merge::merge(&[good1, bad.clone(), missing.clone(), good2], options(&target)).unwrap();
    assert!(!report.is_success());
    assert_eq!(report.sources.len(), 2);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(report.failures[0].path, bad);
    assert_eq!(report.failures[0].table.as_deref(), Some("forum_posts"));
    assert_eq!(report.failures[1].path, missing);

    let conn = Connection::open(&target).unwrap();
    let names: Vec<String> = conn
        .prepare("SELECT spider_name FROM forums ORDER BY id")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(names, vec!["g1", "g2"]);
    assert_eq!(report.orphans(), 0);
}

#[test]
fn keep_target_appends() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    let b = create_source(dir.path(), "forum_b.db", &simple("b", &["y"]), false);
    let target = dir.path().join("merged.db");

    merge::merge(&[a], options(&target)).unwrap();
    let mut opts = options(&target);
    opts.recreate = false;
    merge::merge(&[b], opts).unwrap();

    let conn = Connection::open(&target).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forums"), 2);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forum_posts"), 2);
}

#[test]
fn sidecar_rows_follow_the_source_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    let b = create_source(dir.path(), "forum_b.db", &simple("b", &["y"]), false);
    let side = Connection::open(dir.path().join("forum_b_analysis.db")).unwrap();
    forumdb::analyze::store::init_schema(&side).unwrap();
    side.execute(
        "INSERT INTO token_analysis (post_id, token_count, word_count, character_count,
             analysis_hash, analyzed_at, processing_time_ms)
         VALUES (1, 3, 4, 20, 'abc', '2024-01-01T00:00:00+00:00', 0.4)",
        [],
    )
    .unwrap();
    drop(side);

    let target = dir.path().join("merged.db");
    let report = merge::merge(&[a, b], options(&target)).unwrap();
    assert!(report.sources[0].sidecar.is_none());
    assert!(report.sources[1].sidecar.is_some());

    let conn = Connection::open(&target).unwrap();
    let post_id: i64 = conn
        .query_row("SELECT post_id FROM token_analysis", [], |r| r.get(0))
        .unwrap();
    assert_eq!(post_id, 2);
    let content: String = conn
        .query_row("SELECT content FROM forum_posts WHERE id = ?1", [post_id], |r| r.get(0))
        .unwrap();
    assert_eq!(content, "hello from the forum");
}

fn write_sidecar(source: &Path) {
    let side = Connection::open(source.with_file_name(format!(
        "{}_analysis.db",
        source.file_stem().unwrap().to_str().unwrap()
    )))
    .unwrap();
    forumdb::analyze::store::init_schema(&side).unwrap();
    side.execute(
        "INSERT INTO token_analysis (post_id, token_count, word_count, character_count,
             analysis_hash, analyzed_at, processing_time_ms)
         VALUES (1, 3, 4, 20, 'abc', '2024-01-01T00:00:00+00:00', 0.4)",
        [],
    )
    .unwrap();
    side.execute(
        "INSERT INTO analysis_stats (analysis_date, posts_analyzed, total_tokens, total_words,
             total_characters, processing_time_seconds)
         VALUES ('2024-01-01', 1, 3, 4, 20, 0.0004)",
        [],
    )
    .unwrap();
}

#[test]
fn remerging_a_source_keeps_sidecar_stats_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    write_sidecar(&a);
    let target = dir.path().join("merged.db");

    let mut opts = options(&target);
    opts.use_offsets = false;
    merge::merge(&[a.clone()], opts.clone()).unwrap();
    opts.recreate = false;
    let report = merge::merge(&[a], opts).unwrap();
    assert!(report.is_success());

    let conn = Connection::open(&target).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forum_posts"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM token_analysis"), 1);
    assert_eq!(
        count(&conn, "SELECT posts_analyzed FROM analysis_stats WHERE analysis_date = '2024-01-01'"),
        1
    );
    assert_eq!(
        count(&conn, "SELECT total_tokens FROM analysis_stats WHERE analysis_date = '2024-01-01'"),
        3
    );
}

#[test]
fn sidecar_analysis_is_seen_by_the_analyzer() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    let b = create_source(dir.path(), "forum_b.db", &simple("b", &["y"]), false);
    write_sidecar(&b);

    let settings = Settings {
        target_db: dir.path().join("merged_forums.db"),
        source_db: dir.path().join("merged_forums.db"),
        analysis_db: dir.path().join("analysis").join("analysis_forums.db"),
        show_progress: false,
        ..Settings::default()
    };
    let report = merge::merge(&[a, b], settings.merge_options()).unwrap();
    assert!(report.sources[1].sidecar.is_some());

    let analyzer = Analyzer::new(settings.analyzer_config()).unwrap();
    let pending = analyzer.count_pending(&[]).unwrap();
    assert_eq!(pending.eligible, 2);
    assert_eq!(pending.pending, 1);
    let tasks = analyzer.scan(&[], 10).unwrap();
    assert_eq!(tasks.iter().map(|t| t.post_id).collect::<Vec<_>>(), vec![1]);
}

#[test]
fn table_first_seen_in_a_later_source_gets_its_index() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    Connection::open(&a)
        .unwrap()
        .execute_batch("DROP TABLE forum_posts")
        .unwrap();
    let b = create_source(dir.path(), "forum_b.db", &simple("b", &["y"]), false);
    let target = dir.path().join("merged.db");

    let report = merge::merge(&[a, b], options(&target)).unwrap();
    assert!(report.is_success());

    let conn = Connection::open(&target).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM forum_posts"), 1);
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index'
             AND name IN ('idx_forum_posts_user_id', 'idx_forum_posts_thread_id')"
        ),
        2
    );
}

#[test]
fn dry_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    let structure = merge::dry_run(&[a]).unwrap();
    assert_eq!(structure.len(), 1);
    assert_eq!(structure[0].name, "a");
    let posts = structure[0].tables.iter().find(|t| t.name == "forum_posts").unwrap();
    assert_eq!(posts.row_count, 1);
    assert_eq!(posts.max_id, Some(1));
    assert!(!dir.path().join("merged_forums.db").exists());

    assert!(matches!(
        merge::dry_run(&[dir.path().join("nope.db")]),
        Err(MergeError::SourceNotFound(_))
    ));
}

#[test]
fn no_sources_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let merger = Merger::open(options(&dir.path().join("merged.db"))).unwrap();
    assert!(matches!(merger.merge(&[]), Err(MergeError::NoSources)));
}

#[test]
fn discovered_sources_merge_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    create_source(dir.path(), "forum_a.db", &simple("a", &["x"]), false);
    create_source(dir.path(), "forum_b.db", &simple("b", &["y"]), false);
    let target = dir.path().join("merged_forums.db");
    let sources = merge::find_sources(dir.path(), "forum_*.db", Some(&target)).unwrap();
    assert_eq!(sources.len(), 2);
    let report = merge::merge(&sources, options(&target)).unwrap();
    assert_eq!(report.sources.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
}
