//! SQLite-backed storage for the document graph and the audit ledger.
//!
//! One `CoreDb` owns one connection. Every method is a blocking storage round
//! trip; the async facade in `service` moves them onto the blocking pool.
//! Schema lives in numbered migrations (`crate::migrations`); legacy
//! relationship columns are folded into `document_associations` on every open
//! by the idempotent relationship migrator.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection};

pub mod types;
pub use types::*;

pub struct CoreDb {
    conn: Connection,
}

impl CoreDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so read-then-write
    /// sequences inside (ledger tip lookup, monotonic clamp) cannot interleave
    /// with another writer.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(DbError::from(e)))?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(E::from(DbError::from(e)));
                }
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the configured path and apply the schema.
    pub fn open(config: &crate::config::CoreConfig) -> Result<Self, DbError> {
        let path = config.resolved_database_path()?;
        Self::open_at(path, Duration::from_millis(config.busy_timeout_ms))
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf, busy_timeout: Duration) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(busy_timeout)?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self, DbError> {
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        // Cascades from documents to associations depend on this.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Legacy relationship columns: idempotent, safe to run every open.
        let report = crate::relationship_migrator::migrate_legacy_relationships(&conn, None);
        if report.inserted_total() > 0 || report.has_failures() {
            log::info!("Relationship migration on open: {}", report.summary());
        }

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.docgraph/docgraph.db`.
    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".docgraph").join("docgraph.db"))
    }

    /// Cheap liveness probe used by the admin tooling.
    pub fn schema_version(&self) -> Result<i32, DbError> {
        crate::migrations::current_version(&self.conn).map_err(DbError::Migration)
    }

    /// True if `table` has a column named `column`.
    pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DbError> {
        let mut stmt = conn.prepare(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        )?;
        let count: i64 = stmt.query_row(params![table, column], |row| row.get(0))?;
        Ok(count > 0)
    }
}

pub mod associations;
pub mod audit;
pub mod documents;

// =============================================================================
// Shared test utilities
// =============================================================================


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        for table in ["documents", "document_associations", "audit_logs"] {
            let count: i64 = db
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap_or_else(|_| panic!("{} table should exist", table));
            assert_eq!(count, 0);
        }
        assert_eq!(db.schema_version().unwrap(), 4);
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = test_db();
        let fk: i64 = db
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_with_transaction_rolls_back_on_err() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.insert_workspace("ws-rollback", "Rollback", None)?;
            Err(DbError::InvalidData("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(db.get_workspace_name("ws-rollback").unwrap().is_none());
    }

    #[test]
    fn test_with_transaction_commits_on_ok() {
        let db = test_db();
        let result: Result<(), DbError> =
            db.with_transaction(|tx| tx.insert_workspace("ws-commit", "Commit", None));
        assert!(result.is_ok());
        assert_eq!(db.get_workspace_name("ws-commit").unwrap().as_deref(), Some("Commit"));
    }

    #[test]
    fn test_column_exists() {
        let db = test_db();
        assert!(CoreDb::column_exists(db.conn_ref(), "documents", "document_type").unwrap());
        assert!(!CoreDb::column_exists(db.conn_ref(), "documents", "sprint_id").unwrap());
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        {
            let db = CoreDb::open_at(path.clone(), Duration::from_millis(100)).unwrap();
            seed_workspace(&db, "w1");
        }
        let db = CoreDb::open_at(path, Duration::from_millis(100)).unwrap();
        assert_eq!(db.schema_version().unwrap(), 4);
        assert!(db.get_workspace_name("w1").unwrap().is_some());
    }
}
