use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use super::*;

impl CoreDb {
    // =========================================================================
    // Workspaces and users (owned by collaborators; minimal surface)
    // =========================================================================

    pub fn insert_workspace(
        &self,
        id: &str,
        name: &str,
        sprint_start_date: Option<NaiveDate>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO workspaces (id, name, sprint_start_date, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id,
                name,
                sprint_start_date.map(|d| d.format("%Y-%m-%d").to_string()),
                crate::util::now_timestamp_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_workspace_name(&self, id: &str) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT name FROM workspaces WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// The date sprint 1 of this workspace started, if configured.
    pub fn get_workspace_sprint_start(&self, id: &str) -> Result<Option<NaiveDate>, DbError> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT sprint_start_date FROM workspaces WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(Some)
                .map_err(|e| DbError::InvalidData(format!("sprint_start_date '{}': {}", s, e))),
            None => Ok(None),
        }
    }

    pub fn insert_user(&self, id: &str, email: &str, name: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, email, name, crate::util::now_timestamp_ms()],
        )?;
        Ok(())
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Helper: map a row to `DbDocument`.
    pub(crate) fn map_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbDocument> {
        let properties: String = row.get(4)?;
        Ok(DbDocument {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            document_type: row.get(2)?,
            title: row.get(3)?,
            properties: serde_json::from_str(&properties).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub fn insert_document(&self, doc: &DbDocument) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO documents (id, workspace_id, document_type, title, properties,
                                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                doc.id,
                doc.workspace_id,
                doc.document_type,
                doc.title,
                doc.properties.to_string(),
                doc.created_at,
                doc.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch a document only if it belongs to `workspace_id`.
    ///
    /// A document in another workspace is reported as `None`, exactly like a
    /// missing one.
    pub fn get_document_scoped(
        &self,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<DbDocument>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, workspace_id, document_type, title, properties, created_at, updated_at
                 FROM documents WHERE id = ?1 AND workspace_id = ?2",
                params![id, workspace_id],
                Self::map_document_row,
            )
            .optional()?)
    }

    /// Delete a document in `workspace_id`. Its outgoing and incoming
    /// associations go with it via `ON DELETE CASCADE`.
    pub fn delete_document_scoped(&self, workspace_id: &str, id: &str) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "DELETE FROM documents WHERE id = ?1 AND workspace_id = ?2",
            params![id, workspace_id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::*;
    use crate::entity::RelationshipType;

    #[test]
    fn test_get_document_scoped_hides_other_workspaces() {
        let db = test_db();
        seed_workspace(&db, "ws-a");
        seed_workspace(&db, "ws-b");
        seed_document(&db, "ws-a", "doc-1", "issue");

        assert!(db.get_document_scoped("ws-a", "doc-1").unwrap().is_some());
        assert!(db.get_document_scoped("ws-b", "doc-1").unwrap().is_none());
        assert!(db.get_document_scoped("ws-a", "doc-missing").unwrap().is_none());
    }

    #[test]
    fn test_document_properties_round_trip() {
        let db = test_db();
        seed_workspace(&db, "ws");
        let mut doc = seed_document(&db, "ws", "doc-props", "wiki");
        doc.id = "doc-props-2".to_string();
        doc.properties = serde_json::json!({"state": "open", "estimate": 3});
        db.insert_document(&doc).unwrap();

        let got = db.get_document_scoped("ws", "doc-props-2").unwrap().unwrap();
        assert_eq!(got.properties["estimate"], 3);
        assert_eq!(got.document_type, "wiki");
    }

    #[test]
    fn test_delete_document_cascades_associations() {
        let db = test_db();
        seed_workspace(&db, "ws");
        seed_document(&db, "ws", "issue-1", "issue");
        seed_document(&db, "ws", "sprint-1", "sprint");
        db.upsert_association("issue-1", "sprint-1", RelationshipType::Sprint, &serde_json::json!({}))
            .unwrap();

        assert!(!db.delete_document_scoped("ws-other", "sprint-1").unwrap());
        assert!(db.delete_document_scoped("ws", "sprint-1").unwrap());
        assert!(db
            .list_associations_by_document("issue-1", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_workspace_sprint_start() {
        let db = test_db();
        let start = chrono::NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        db.insert_workspace("ws", "WS", Some(start)).unwrap();
        seed_workspace(&db, "ws-none");
        assert_eq!(db.get_workspace_sprint_start("ws").unwrap(), Some(start));
        assert_eq!(db.get_workspace_sprint_start("ws-none").unwrap(), None);
        assert_eq!(db.get_workspace_sprint_start("ws-missing").unwrap(), None);
    }
}
