use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};

use super::*;
use crate::entity::RelationshipType;

const ASSOCIATION_COLUMNS: &str =
    "id, document_id, related_id, relationship_type, metadata, created_at";

impl CoreDb {
    // =========================================================================
    // Document associations
    // =========================================================================

    /// Helper: map a row to `DbAssociation`.
    pub(crate) fn map_association_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbAssociation> {
        let rt: String = row.get(3)?;
        let relationship_type = RelationshipType::parse(&rt).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown relationship_type '{}'", rt).into(),
            )
        })?;
        let metadata: String = row.get(4)?;
        Ok(DbAssociation {
            id: row.get(0)?,
            document_id: row.get(1)?,
            related_id: row.get(2)?,
            relationship_type,
            metadata: serde_json::from_str(&metadata).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })?,
            created_at: row.get(5)?,
        })
    }

    /// Insert an edge if the `(document, related, type)` triple is new.
    ///
    /// Returns the new row, or `None` if the edge already existed. A single
    /// statement, so concurrent inserts of the same edge converge on one row.
    pub fn insert_association(
        &self,
        document_id: &str,
        related_id: &str,
        relationship_type: RelationshipType,
        metadata: &serde_json::Value,
    ) -> Result<Option<DbAssociation>, DbError> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO document_associations
                    (document_id, related_id, relationship_type, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(document_id, related_id, relationship_type) DO NOTHING",
                params![
                    document_id,
                    related_id,
                    relationship_type.as_str(),
                    metadata.to_string(),
                    crate::util::now_timestamp_ms(),
                ],
            )
            .map_err(DbError::from)
            .inspect_err(|e| {
                if let DbError::Integrity(detail) = e {
                    log::error!(
                        "Dangling association {} -[{}]-> {}: {}",
                        document_id,
                        relationship_type,
                        related_id,
                        detail
                    );
                }
            })?;

        if inserted == 0 {
            return Ok(None);
        }

        let row_id = self.conn.last_insert_rowid();
        let row = self.conn.query_row(
            &format!("SELECT {} FROM document_associations WHERE id = ?1", ASSOCIATION_COLUMNS),
            params![row_id],
            Self::map_association_row,
        )?;
        Ok(Some(row))
    }

    /// Idempotent insert: returns the stored edge whether or not this call created it.
    ///
    /// An existing edge is left untouched; `metadata` is not overwritten.
    pub fn upsert_association(
        &self,
        document_id: &str,
        related_id: &str,
        relationship_type: RelationshipType,
        metadata: &serde_json::Value,
    ) -> Result<DbAssociation, DbError> {
        if let Some(row) =
            self.insert_association(document_id, related_id, relationship_type, metadata)?
        {
            return Ok(row);
        }
        self.get_association(document_id, related_id, relationship_type)?
            .ok_or_else(|| {
                DbError::InvalidData(format!(
                    "association {} -[{}]-> {} vanished after conflict",
                    document_id, relationship_type, related_id
                ))
            })
    }

    pub fn get_association(
        &self,
        document_id: &str,
        related_id: &str,
        relationship_type: RelationshipType,
    ) -> Result<Option<DbAssociation>, DbError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM document_associations
                     WHERE document_id = ?1 AND related_id = ?2 AND relationship_type = ?3",
                    ASSOCIATION_COLUMNS
                ),
                params![document_id, related_id, relationship_type.as_str()],
                Self::map_association_row,
            )
            .optional()?)
    }

    /// Edges where `document_id` is the source, in insertion order.
    pub fn list_associations_by_document(
        &self,
        document_id: &str,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<DbAssociation>, DbError> {
        self.list_associations_where("document_id", document_id, relationship_type)
    }

    /// Edges pointing at `related_id` ("what belongs to this entity"), in insertion order.
    pub fn list_associations_by_related(
        &self,
        related_id: &str,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<DbAssociation>, DbError> {
        self.list_associations_where("related_id", related_id, relationship_type)
    }

    fn list_associations_where(
        &self,
        column: &'static str,
        id: &str,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<DbAssociation>, DbError> {
        let sql = format!(
            "SELECT {} FROM document_associations
             WHERE {} = ?1 AND (?2 IS NULL OR relationship_type = ?2)
             ORDER BY id",
            ASSOCIATION_COLUMNS, column
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![id, relationship_type.map(|r| r.as_str())],
            Self::map_association_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Remove edges where `document_id` is the source. Returns the number removed.
    pub fn delete_associations_by_document(
        &self,
        document_id: &str,
        relationship_type: Option<RelationshipType>,
    ) -> Result<usize, DbError> {
        let rows = self.conn.execute(
            "DELETE FROM document_associations
             WHERE document_id = ?1 AND (?2 IS NULL OR relationship_type = ?2)",
            params![document_id, relationship_type.map(|r| r.as_str())],
        )?;
        Ok(rows)
    }

    /// Walk `chain` outward from `root_id`, one relationship type per hop.
    ///
    /// Hop `n` collects every document holding a `chain[n]` edge into a document
    /// found at hop `n - 1`. The result is the root plus all hops, restricted to
    /// documents in `workspace_id`, with each document listed once no matter how
    /// many edges reached it. A hop never steps onto a document in another
    /// workspace, so no path can pass through a foreign tenant.
    pub fn resolve_descendants(
        &self,
        workspace_id: &str,
        root_id: &str,
        chain: &[RelationshipType],
    ) -> Result<Vec<String>, DbError> {
        let mut members: BTreeSet<String> = BTreeSet::new();
        members.insert(root_id.to_string());

        let mut frontier: Vec<String> = vec![root_id.to_string()];
        let mut hop_stmt = self.conn.prepare(
            "SELECT DISTINCT a.document_id FROM document_associations a
             INNER JOIN documents d ON d.id = a.document_id
             WHERE a.relationship_type = ?1
               AND a.related_id IN (SELECT value FROM json_each(?2))
               AND d.workspace_id = ?3",
        )?;

        for relationship_type in chain {
            if frontier.is_empty() {
                break;
            }
            let frontier_json = serde_json::to_string(&frontier)
                .map_err(|e| DbError::InvalidData(e.to_string()))?;
            let next = hop_stmt
                .query_map(
                    params![relationship_type.as_str(), frontier_json, workspace_id],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            members.extend(next.iter().cloned());
            frontier = next;
        }

        let members_json = serde_json::to_string(&members.into_iter().collect::<Vec<_>>())
            .map_err(|e| DbError::InvalidData(e.to_string()))?;
        let mut scoped = self.conn.prepare(
            "SELECT id FROM documents
             WHERE workspace_id = ?1 AND id IN (SELECT value FROM json_each(?2))
             ORDER BY id",
        )?;
        let ids = scoped
            .query_map(params![workspace_id, members_json], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Documents in `workspace_id` holding more than one edge of a type that is
    /// single-valued by convention.
    pub fn cardinality_violations(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<CardinalityViolation>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.document_id, a.relationship_type, COUNT(*)
             FROM document_associations a
             INNER JOIN documents d ON d.id = a.document_id
             WHERE d.workspace_id = ?1
             GROUP BY a.document_id, a.relationship_type
             HAVING COUNT(*) > 1
             ORDER BY a.document_id, a.relationship_type",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut violations = Vec::new();
        for row in rows {
            let (document_id, rt, edge_count) = row?;
            let Some(relationship_type) = RelationshipType::parse(&rt) else {
                continue;
            };
            if relationship_type.is_single_valued() {
                violations.push(CardinalityViolation {
                    document_id,
                    relationship_type,
                    edge_count,
                });
            }
        }
        Ok(violations)
    }
}
