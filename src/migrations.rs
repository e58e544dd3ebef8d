//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.
//!
//! Databases created before the framework existed already have a `documents`
//! table (usually still carrying the legacy `parent_id`/`project_id`/
//! `sprint_id`/`program_id` columns), and may lack `users` or `workspaces`.
//! Every baseline statement is `IF NOT EXISTS`, so the baseline runs for those
//! too and only fills in what is missing; they are backed up first.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("migrations/002_document_associations.sql"),
    },
    Migration {
        version: 3,
        sql: include_str!("migrations/003_audit_logs.sql"),
    },
    Migration {
        version: 4,
        sql: include_str!("migrations/004_ledgered_erasure.sql"),
    },
];

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))
}

/// Return the highest applied migration version, or 0 if none.
pub(crate) fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Detect a pre-framework database: unversioned, but already holding documents.
fn is_pre_framework_db(conn: &Connection) -> Result<bool, String> {
    if current_version(conn)? > 0 {
        return Ok(false);
    }

    let has_documents = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'documents'")
        .and_then(|mut stmt| stmt.exists([]))
        .map_err(|e| format!("Failed to inspect existing schema: {}", e))?;

    if has_documents {
        log::info!("Migration bootstrap: existing unversioned database, baseline fills missing tables");
    }
    Ok(has_documents)
}

/// Back up the database before applying migrations.
///
/// Uses SQLite's online backup API to create a hot copy at
/// `<db_path>.pre-migration.bak`. Only called when there are pending migrations.
fn backup_before_migration(conn: &Connection) -> Result<(), String> {
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Failed to get database path: {}", e))?;

    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = rusqlite::Connection::open(&backup_path)
        .map_err(|e| format!("Failed to open backup file: {}", e))?;

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| format!("Failed to initialize pre-migration backup: {}", e))?;

    backup
        .step(-1)
        .map_err(|e| format!("Pre-migration backup failed: {}", e))?;

    log::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
/// Each migration and its version row commit together.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;
    let pre_framework = is_pre_framework_db(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(format!(
            "Database schema version ({}) is newer than this version of docgraph supports ({}). \
             Please upgrade docgraph.",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        return Ok(0);
    }

    // A fresh database has nothing worth backing up.
    if pre_framework || current > 0 {
        backup_before_migration(conn)?;
    }

    for migration in &pending {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("Migration v{} could not begin: {}", migration.version, e))?;
        tx.execute_batch(migration.sql)
            .map_err(|e| format!("Migration v{} failed: {}", migration.version, e))?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )
        .map_err(|e| format!("Failed to record migration v{}: {}", migration.version, e))?;
        tx.commit()
            .map_err(|e| format!("Migration v{} could not commit: {}", migration.version, e))?;

        log::info!("Applied migration v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn test_fresh_db_applies_all() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 4);
        assert_eq!(current_version(&conn).unwrap(), 4);

        for table in ["workspaces", "users", "documents", "document_associations", "audit_logs"] {
            assert!(table_exists(&conn, table), "{} should exist", table);
        }
        assert!(!table_exists(&conn, "audit_erasure_grants"));
    }

    #[test]
    fn test_relationship_type_check_constraint() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO workspaces (id, name, created_at) VALUES ('w', 'W', '2025-01-01');
             INSERT INTO documents (id, workspace_id, document_type, created_at, updated_at)
             VALUES ('a', 'w', 'issue', '2025-01-01', '2025-01-01'),
                    ('b', 'w', 'sprint', '2025-01-01', '2025-01-01');",
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO document_associations (document_id, related_id, relationship_type, created_at)
             VALUES ('a', 'b', 'owner', '2025-01-01')",
            [],
        );
        assert!(result.is_err(), "unknown relationship types must be rejected by the schema");
    }

    #[test]
    fn test_bootstrap_existing_db() {
        let conn = mem_db();

        // Pre-framework database: documents with legacy single-valued columns.
        conn.execute_batch(
            "CREATE TABLE workspaces (id TEXT PRIMARY KEY, name TEXT NOT NULL,
                sprint_start_date TEXT, created_at TEXT NOT NULL);
             CREATE TABLE users (id TEXT PRIMARY KEY, email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL, created_at TEXT NOT NULL);
             CREATE TABLE documents (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                document_type TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                properties TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                parent_id TEXT,
                sprint_id TEXT
             );
             INSERT INTO workspaces (id, name, created_at) VALUES ('w', 'W', '2025-01-01');
             INSERT INTO documents (id, workspace_id, document_type, created_at, updated_at)
             VALUES ('existing', 'w', 'wiki', '2025-01-01', '2025-01-01');",
        )
        .expect("seed existing db");

        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 4);
        assert_eq!(current_version(&conn).unwrap(), 4);

        let doc_type: String = conn
            .query_row(
                "SELECT document_type FROM documents WHERE id = 'existing'",
                [],
                |row| row.get(0),
            )
            .expect("existing data should be preserved");
        assert_eq!(doc_type, "wiki");
    }

    #[test]
    fn test_existing_db_without_identity_tables_gets_them() {
        let conn = mem_db();
        conn.execute_batch(
            "CREATE TABLE documents (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                document_type TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                properties TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                program_id TEXT
             );
             INSERT INTO documents (id, workspace_id, document_type, created_at, updated_at)
             VALUES ('legacy', 'w', 'issue', '2025-01-01', '2025-01-01');",
        )
        .unwrap();

        run_migrations(&conn).expect("migrations should succeed");
        assert!(table_exists(&conn, "users"));
        assert!(table_exists(&conn, "workspaces"));

        let joined: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_logs l LEFT JOIN users u ON u.id = l.actor_user_id",
                [],
                |row| row.get(0),
            )
            .expect("audit join should resolve users");
        assert_eq!(joined, 0);
        let kept: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();
        ensure_schema_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(
            err.contains("newer than this version"),
            "error should mention version mismatch: {}",
            err
        );
    }

    #[test]
    fn test_idempotency() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).expect("first run"), 4);
        assert_eq!(run_migrations(&conn).expect("second run"), 0);
        assert_eq!(current_version(&conn).unwrap(), 4);
    }

    #[test]
    fn test_pre_migration_backup_created_for_existing_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test_backup.db");

        let conn = Connection::open(&db_path).expect("open db");
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE documents (id TEXT PRIMARY KEY, workspace_id TEXT NOT NULL,
                document_type TEXT NOT NULL, title TEXT NOT NULL DEFAULT '',
                properties TEXT NOT NULL DEFAULT '{}', created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL);
             CREATE TABLE workspaces (id TEXT PRIMARY KEY, name TEXT NOT NULL,
                sprint_start_date TEXT, created_at TEXT NOT NULL);",
        )
        .unwrap();

        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 4);

        let backup_path = dir.path().join("test_backup.db.pre-migration.bak");
        assert!(
            backup_path.exists(),
            "pre-migration backup should be created at {}",
            backup_path.display()
        );
    }
}
