use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use sqlgate_db::{
    CellValue, ColumnCheck, ColumnMigrationState, ConstraintKind, ErrorCategory, ExecutionError,
    ExecutionResult, Executor, ExecutorConfig, INSIGHTS_MEMO_URI, JSON_DIAGNOSTICS_URI, Params,
    ResourceObserver, StatementClass,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Executor {
    Executor::open(ExecutorConfig::new(dir.path().join("gateway.db"))).expect("open executor")
}

fn count(executor: &Executor, table: &str) -> i64 {
    let rows = executor
        .read(&format!("SELECT COUNT(*) AS n FROM {table}"), &Params::None)
        .expect("count");
    rows[0].get("n").and_then(CellValue::as_i64).expect("n")
}

#[test]
fn duplicate_key_rolls_back_and_is_classified() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);
    executor
        .create_schema("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
        .expect("create");
    let inserted = executor
        .execute("INSERT INTO t (id, name) VALUES (1, 'a')", &Params::None)
        .expect("insert");
    assert_eq!(inserted, ExecutionResult::Affected { affected_rows: 1 });

    let err = executor
        .execute("INSERT INTO t (id, name) VALUES (1, 'b')", &Params::None)
        .expect_err("duplicate key");
    let diagnosis = err.diagnosis().expect("diagnosis");
    assert_eq!(diagnosis.category, ErrorCategory::ConstraintViolation);
    assert_eq!(diagnosis.constraint, Some(ConstraintKind::Unique));
    assert_eq!(err.status(), "DatabaseError");
    assert!(err.to_string().starts_with("Database error: "));

    let rows = executor.read("SELECT * FROM t", &Params::None).expect("select");
    assert_eq!(rows.len(), 1);
    assert_eq!(serde_json::to_value(&rows[0]).expect("json"), json!({"id": 1, "name": "a"}));
}

#[test]
fn failed_multi_row_write_leaves_table_unchanged() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);
    executor
        .create_schema("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
        .expect("create");
    executor
        .write("INSERT INTO t (id, name) VALUES (?, ?)", &Params::Positional(vec![json!(1), json!("a")]))
        .expect("seed");
    let err = executor
        .write("INSERT INTO t (id, name) VALUES (2, 'b'), (3, NULL)", &Params::None)
        .expect_err("not null");
    assert_eq!(err.diagnosis().and_then(|d| d.constraint), Some(ConstraintKind::NotNull));
    assert_eq!(count(&executor, "t"), 1);

    // The connection went back to the pool outside any transaction.
    executor
        .write("UPDATE t SET name = 'z' WHERE id = 1", &Params::None)
        .expect("update after failure");
}

#[test]
fn reads_do_not_mutate_and_class_misuse_fails_fast() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);
    executor
        .create_schema("CREATE TABLE t (id INTEGER PRIMARY KEY)")
        .expect("create");
    executor
        .write("INSERT INTO t (id) VALUES (1), (2)", &Params::None)
        .expect("seed");
    for _ in 0..3 {
        executor.read("SELECT * FROM t", &Params::None).expect("read");
    }
    assert_eq!(count(&executor, "t"), 2);

    let err = executor
        .read("DELETE FROM t", &Params::None)
        .expect_err("write through read path");
    assert!(matches!(
        err,
        ExecutionError::StatementClassMismatch {
            actual: StatementClass::Write,
            ..
        }
    ));
    assert_eq!(err.status(), "InvalidInput");
    assert!(executor.write("SELECT * FROM t", &Params::None).is_err());
    assert!(executor.create_schema("DROP TABLE t").is_err());
    assert!(executor.execute("BEGIN", &Params::None).is_err());
    assert_eq!(count(&executor, "t"), 2);
}

#[test]
fn insights_render_and_notify() {
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ResourceObserver for Recorder {
        fn resource_updated(&self, uri: &str) {
            self.0.lock().unwrap().push(uri.to_string());
        }
    }

    let dir = TempDir::new().expect("tempdir");
    let recorder = Arc::new(Recorder::default());
    let executor = open(&dir).with_observer(recorder.clone());
    assert_eq!(
        executor.read_resource(INSIGHTS_MEMO_URI).expect("memo"),
        "No business insights have been discovered yet."
    );
    executor.append_insight("Revenue grew 12% in Q2").expect("first");
    executor.append_insight("Churn dropped").expect("second");

    let memo = executor.read_resource(INSIGHTS_MEMO_URI).expect("memo");
    let first = memo.find("- Revenue grew 12% in Q2").expect("first bullet");
    let second = memo.find("- Churn dropped").expect("second bullet");
    assert!(first < second);
    assert!(memo.contains("2 key business insights"));
    assert_eq!(recorder.0.lock().unwrap().len(), 2);
    assert!(executor.append_insight("   ").is_err());
}

#[test]
fn memory_journal_text_column_migrates_on_open() {
    let dir = TempDir::new().expect("tempdir");
    {
        let executor = Executor::open(ExecutorConfig {
            jsonb_enabled: false,
            ..ExecutorConfig::new(dir.path().join("gateway.db"))
        })
        .expect("open without binary JSON");
        executor
            .create_schema(
                "CREATE TABLE memory_journal (id INTEGER PRIMARY KEY, content TEXT, metadata TEXT)",
            )
            .expect("create");
        executor
            .write(
                "INSERT INTO memory_journal (content, metadata) VALUES (?, ?), (?, ?)",
                &Params::Positional(vec![
                    json!("a"),
                    json!("{\"tags\": [\"x\"]}"),
                    json!("b"),
                    json!(null),
                ]),
            )
            .expect("seed");
    }

    let executor = open(&dir);
    let (_, state) = &executor.migration_states()[0];
    match state {
        ColumnMigrationState::MigrationAttempted(outcome) => {
            assert!(outcome.success, "{:?}", outcome.error);
            assert_eq!(outcome.rows_before, 2);
            assert_eq!(outcome.rows_after, outcome.rows_before);
        }
        other => panic!("expected a migration, got {other:?}"),
    }
    let rows = executor
        .read("SELECT metadata FROM memory_journal ORDER BY id", &Params::None)
        .expect("read back");
    assert_eq!(rows[0].get("metadata"), Some(&CellValue::Json(json!({"tags": ["x"]}))));
    assert_eq!(rows[1].get("metadata"), Some(&CellValue::Null));

    let reopened = open(&dir);
    assert_eq!(
        reopened.migration_states()[0].1,
        ColumnMigrationState::Checked(ColumnCheck::Optimal)
    );
}

#[test]
fn metadata_parameters_are_stored_as_binary_json() {
    let dir = TempDir::new().expect("tempdir");
    open(&dir)
        .create_schema("CREATE TABLE memory_journal (id INTEGER PRIMARY KEY, content TEXT, metadata BLOB)")
        .expect("create");
    // Reopen so the startup pass sees the table and installs its trigger.
    let executor = open(&dir);
    let params: Params =
        serde_json::from_value(json!({"content": "note", "metadata": "{\"mood\": \"calm\"}"}))
            .expect("params");
    executor
        .write(
            "INSERT INTO memory_journal (content, metadata) VALUES (:content, :metadata)",
            &params,
        )
        .expect("insert");
    let rows = executor
        .read(
            "SELECT typeof(metadata) AS kind, metadata ->> '$.mood' AS mood FROM memory_journal",
            &Params::None,
        )
        .expect("inspect");
    assert_eq!(rows[0].get("kind").and_then(CellValue::as_str), Some("blob"));
    assert_eq!(rows[0].get("mood").and_then(CellValue::as_str), Some("calm"));

    let update: Params = serde_json::from_value(json!([{"mood": "tired"}, 1])).expect("params");
    executor
        .write("UPDATE memory_journal SET metadata = ? WHERE id = ?", &update)
        .expect("update");
    let rows = executor
        .read("SELECT metadata FROM memory_journal", &Params::None)
        .expect("read");
    assert_eq!(rows[0].get("metadata"), Some(&CellValue::Json(json!({"mood": "tired"}))));

    let err = executor
        .write(
            "INSERT INTO memory_journal (content, metadata) VALUES (?, ?)",
            &Params::Positional(vec![json!("bad"), json!("{not json")]),
        )
        .expect_err("trigger rejects invalid JSON");
    let diagnosis = err.diagnosis().expect("diagnosis");
    assert_eq!(diagnosis.category, ErrorCategory::InvalidJson);
    assert!(err.to_string().contains("\nSuggestion: "));
    assert_eq!(count(&executor, "memory_journal"), 1);
}

#[test]
fn json_extract_over_malformed_blob_is_type_mismatch() {
    let dir = TempDir::new().expect("tempdir");
    let executor = Executor::open(ExecutorConfig {
        jsonb_enabled: false,
        ..ExecutorConfig::new(dir.path().join("gateway.db"))
    })
    .expect("open");
    executor
        .create_schema("CREATE TABLE memory_journal (id INTEGER PRIMARY KEY, metadata BLOB)")
        .expect("create");
    executor
        .write("INSERT INTO memory_journal (metadata) VALUES (X'FFFEFD')", &Params::None)
        .expect("raw blob");
    let err = executor
        .read(
            "SELECT json_extract(metadata, '$.a') FROM memory_journal",
            &Params::None,
        )
        .expect_err("malformed binary value");
    let diagnosis = err.diagnosis().expect("diagnosis");
    assert_eq!(diagnosis.category, ErrorCategory::JsonTypeMismatch);
    assert!(diagnosis.is_json_related);
    assert!(!diagnosis.suggestions.is_empty());
    assert!(err.to_string().contains(&diagnosis.suggestions[0]));
}

#[test]
fn admin_operations_report_state() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);
    executor
        .create_schema("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)")
        .expect("create");
    executor
        .create_schema("CREATE INDEX idx_users_email ON users (email)")
        .expect("index");

    assert_eq!(executor.list_tables().expect("tables"), vec!["users".to_string()]);
    let columns = executor.describe_table("users").expect("describe");
    let names: Vec<&str> = columns
        .iter()
        .filter_map(|row| row.get("name").and_then(CellValue::as_str))
        .collect();
    assert_eq!(names, vec!["id", "email"]);
    assert!(executor.describe_table("users; DROP TABLE users").is_err());
    assert_eq!(executor.list_tables().expect("tables").len(), 1);

    let report = executor.integrity_check().expect("integrity");
    assert!(report.ok);
    assert_eq!(report.messages, vec!["ok".to_string()]);

    let stats = executor.database_stats().expect("stats");
    assert_eq!(stats.table_count, 1);
    assert_eq!(stats.index_count, 1);
    assert_eq!(stats.database_size_bytes, stats.page_count * stats.page_size);

    let indexes = executor.index_usage_stats().expect("indexes");
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].name, "idx_users_email");
    assert_eq!(indexes[0].tbl_name, "users");

    executor.analyze().expect("analyze");
    executor.vacuum().expect("vacuum");
}

#[test]
fn full_text_search_ranks_and_snippets() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);
    executor
        .create_schema("CREATE TABLE articles (id INTEGER PRIMARY KEY, title TEXT, body TEXT)")
        .expect("create");
    executor
        .write(
            "INSERT INTO articles (title, body) VALUES \
             ('Rust pools', 'connection pools keep sqlite handles warm'), \
             ('Gardening', 'tomatoes need sun'), \
             ('SQLite tips', 'sqlite full text search with fts5')",
            &Params::None,
        )
        .expect("seed");

    let created = executor
        .create_search_index(
            "articles_fts",
            &["title".to_string(), "body".to_string()],
            Some("articles"),
            Some("porter unicode61"),
        )
        .expect("create index");
    assert_eq!(created.populated_rows, Some(3));

    let results = executor
        .search("articles_fts", "sqlite", None, Some(500))
        .expect("search");
    assert_eq!(results.results_count, 2);
    assert_eq!(results.results.len(), 2);
    let snippet = results.results[0]
        .get("snippet")
        .and_then(CellValue::as_str)
        .expect("snippet");
    assert!(snippet.contains("<mark>"));
    assert!(results.results[0].get("rank").is_some());

    let limited = executor
        .search("articles_fts", "sqlite", Some(0), None)
        .expect("clamped limit");
    assert_eq!(limited.results_count, 1);

    executor.rebuild_search_index("articles_fts").expect("rebuild");
    assert!(
        executor
            .create_search_index("bad_fts", &["a".to_string()], None, Some("icu"))
            .is_err()
    );
}

#[test]
fn json_diagnostics_and_resources() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);

    let valid = executor.validate_json("{\"a\": [1, 2]}");
    assert!(valid.valid);
    assert_eq!(valid.parsed, Some(json!({"a": [1, 2]})));
    let invalid = executor.validate_json("{\"a\": }");
    assert!(!invalid.valid);
    assert!(invalid.message.starts_with("JSON is invalid"));

    let conversion = executor
        .test_jsonb_conversion("{\"nested\": {\"k\": [true, null]}}")
        .expect("conversion");
    assert!(conversion.conversion_successful);
    assert!(conversion.binary_bytes > 0);
    let failed = executor.test_jsonb_conversion("[1,").expect("reported, not raised");
    assert!(!failed.valid);

    let diagnostics: serde_json::Value =
        serde_json::from_str(&executor.read_resource(JSON_DIAGNOSTICS_URI).expect("diagnostics"))
            .expect("json document");
    assert_eq!(diagnostics["jsonb_support"], json!(true));
    assert_eq!(diagnostics["binary_json_columns"][0]["table"], json!("memory_journal"));
    assert!(executor.read_resource("memo://other").is_err());
    assert!(executor.read_resource("ftp://x").is_err());

    let names: Vec<&str> = executor.tools().iter().map(|tool| tool.name).collect();
    assert!(names.contains(&"validate_json"));
}

#[test]
fn memory_database_uses_a_single_connection() {
    let executor = Executor::open(ExecutorConfig::new(sqlgate_db::MEMORY_PATH)).expect("open");
    assert_eq!(executor.pool().max_size(), 1);
    executor
        .create_schema("CREATE TABLE t (id INTEGER)")
        .expect("create");
    executor
        .write("INSERT INTO t VALUES (1)", &Params::None)
        .expect("insert");
    assert_eq!(count(&executor, "t"), 1);
}

#[test]
fn contended_write_lock_is_retryable_but_missing_column_is_not() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("gateway.db");
    let executor = Executor::open(ExecutorConfig {
        busy_timeout: Duration::from_millis(10),
        ..ExecutorConfig::new(path.clone())
    })
    .expect("open");
    executor
        .create_schema("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER)")
        .expect("create");

    let holder = rusqlite::Connection::open(&path).expect("second connection");
    holder.execute_batch("BEGIN IMMEDIATE").expect("hold write lock");
    let err = executor
        .write("INSERT INTO accounts (balance) VALUES (10)", &Params::None)
        .expect_err("write lock is held elsewhere");
    let diagnosis = err.diagnosis().expect("diagnosis");
    assert_eq!(diagnosis.category, ErrorCategory::Locked);
    assert!(diagnosis.retryable);
    assert_eq!(err.status(), "Busy");
    holder.execute_batch("ROLLBACK").expect("release write lock");

    executor
        .write("INSERT INTO accounts (balance) VALUES (10)", &Params::None)
        .expect("write after release");
    assert_eq!(count(&executor, "accounts"), 1);

    let err = executor
        .read("SELECT is_locked FROM accounts", &Params::None)
        .expect_err("missing column");
    let diagnosis = err.diagnosis().expect("diagnosis");
    assert_eq!(diagnosis.category, ErrorCategory::Unclassified);
    assert!(!diagnosis.retryable);
    assert_eq!(err.status(), "DatabaseError");
}

#[test]
fn undecodable_metadata_blob_is_returned_raw() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);
    assert!(executor.capabilities().jsonb_active());
    // Created after open, so no validation trigger guards the column.
    executor
        .create_schema("CREATE TABLE memory_journal (id INTEGER PRIMARY KEY, metadata BLOB)")
        .expect("create");
    executor
        .write(
            "INSERT INTO memory_journal (id, metadata) VALUES (1, X'FFFEFD'), (2, jsonb('{\"a\": 1}'))",
            &Params::None,
        )
        .expect("insert");
    let rows = executor
        .read("SELECT id, metadata FROM memory_journal ORDER BY id", &Params::None)
        .expect("read survives an undecodable blob");
    assert_eq!(rows[0].get("metadata"), Some(&CellValue::Blob(vec![0xFF, 0xFE, 0xFD])));
    assert_eq!(rows[1].get("metadata"), Some(&CellValue::Json(json!({"a": 1}))));
}

#[test]
fn returning_clause_reports_affected_rows() {
    let dir = TempDir::new().expect("tempdir");
    let executor = open(&dir);
    executor
        .create_schema("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
        .expect("create");
    let inserted = executor
        .write(
            "INSERT INTO t (name) VALUES ('a'), ('b') RETURNING id",
            &Params::None,
        )
        .expect("insert");
    assert_eq!(inserted, ExecutionResult::Affected { affected_rows: 2 });
    assert_eq!(count(&executor, "t"), 2);
}
