//! Append-only audit ledger storage.
//!
//! Rows are only ever inserted. The `audit_logs_no_update` and
//! `audit_logs_no_delete` triggers reject every other write at the engine
//! level, so the guarantee holds for ad-hoc SQL as much as for this module.
//! The one exception, erasing a workspace, needs an erasure event on the
//! global stream, which itself can never be deleted.
//! Each workspace (and the global, workspace-less stream) forms its own
//! SHA-256 hash chain; `verify_audit_chain` recomputes it.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use super::*;

/// Global-stream action that unlocks deletion of one workspace's rows.
pub const ERASURE_ACTION: &str = "audit.workspace_erased";

/// `prev_hash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const AUDIT_COLUMNS: &str = "seq, id, workspace_id, actor_user_id, impersonating_user_id, action,
     resource_type, resource_id, details, ip_address, user_agent, created_at,
     prev_hash, entry_hash";

/// Out-of-band approval for erasing a workspace's audit history.
///
/// Only the erasure path accepts this; nothing in the ordinary service API
/// constructs one.
#[derive(Debug, Clone)]
pub struct ErasureAuthorization {
    /// Operator (or external ticket) approving the erasure.
    pub authorized_by: String,
    pub reason: String,
}

/// Canonical hash of one ledger entry, chained to its predecessor.
///
/// Every field is length-prefixed; `None` uses a sentinel length so it never
/// collides with an empty string.
#[allow(clippy::too_many_arguments)]
pub fn compute_entry_hash(
    prev_hash: &str,
    id: &str,
    workspace_id: Option<&str>,
    actor_user_id: &str,
    impersonating_user_id: Option<&str>,
    action: &str,
    resource_type: Option<&str>,
    resource_id: Option<&str>,
    details: &str,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
    created_at: &str,
) -> String {
    fn feed(hasher: &mut Sha256, field: Option<&str>) {
        match field {
            Some(s) => {
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            None => hasher.update(u64::MAX.to_be_bytes()),
        }
    }

    let mut hasher = Sha256::new();
    for field in [
        Some(prev_hash),
        Some(id),
        workspace_id,
        Some(actor_user_id),
        impersonating_user_id,
        Some(action),
        resource_type,
        resource_id,
        Some(details),
        ip_address,
        user_agent,
        Some(created_at),
    ] {
        feed(&mut hasher, field);
    }
    hex::encode(hasher.finalize())
}

fn hash_of(event: &DbAuditEvent) -> String {
    compute_entry_hash(
        &event.prev_hash,
        &event.id,
        event.workspace_id.as_deref(),
        &event.actor_user_id,
        event.impersonating_user_id.as_deref(),
        &event.action,
        event.resource_type.as_deref(),
        event.resource_id.as_deref(),
        &event.details.to_string(),
        event.ip_address.as_deref(),
        event.user_agent.as_deref(),
        &event.created_at,
    )
}

impl CoreDb {
    // =========================================================================
    // Audit ledger
    // =========================================================================

    /// Helper: map a row to `DbAuditEvent`.
    pub(crate) fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbAuditEvent> {
        let details: String = row.get(8)?;
        Ok(DbAuditEvent {
            seq: row.get(0)?,
            id: row.get(1)?,
            workspace_id: row.get(2)?,
            actor_user_id: row.get(3)?,
            impersonating_user_id: row.get(4)?,
            action: row.get(5)?,
            resource_type: row.get(6)?,
            resource_id: row.get(7)?,
            details: serde_json::from_str(&details).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
            })?,
            ip_address: row.get(9)?,
            user_agent: row.get(10)?,
            created_at: row.get(11)?,
            prev_hash: row.get(12)?,
            entry_hash: row.get(13)?,
        })
    }

    /// Append one event to the ledger, stamped with the current time.
    pub fn record_audit_event(&self, event: &NewAuditEvent) -> Result<DbAuditEvent, DbError> {
        self.record_audit_event_at(event, Utc::now())
    }

    /// Append one event, proposing `now` as its timestamp.
    ///
    /// The stored `created_at` is `max(now, last created_at in the same
    /// workspace)`, so insertion order and timestamp order never disagree.
    /// Runs in its own transaction unless the caller already holds one.
    /// Re-recording an event id that is already stored returns the stored row.
    pub fn record_audit_event_at(
        &self,
        event: &NewAuditEvent,
        now: DateTime<Utc>,
    ) -> Result<DbAuditEvent, DbError> {
        if event.actor_user_id.trim().is_empty() || event.action.trim().is_empty() {
            return Err(DbError::InvalidData(
                "audit event requires actor and action".to_string(),
            ));
        }
        if self.conn.is_autocommit() {
            self.with_transaction(|db| db.append_audit_event(event, now))
        } else {
            self.append_audit_event(event, now)
        }
    }

    fn append_audit_event(
        &self,
        event: &NewAuditEvent,
        now: DateTime<Utc>,
    ) -> Result<DbAuditEvent, DbError> {
        let id = event
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // A retry in the same stream returns the stored row. The same id in
        // another stream is a collision, and the foreign row never leaves here.
        if let Some(existing) = self.get_audit_event(&id)? {
            if existing.workspace_id != event.workspace_id {
                log::warn!("Audit event id {} reused across workspaces", id);
                return Err(DbError::Integrity(format!(
                    "audit event id {} is already in use",
                    id
                )));
            }
            return Ok(existing);
        }

        let tip: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT created_at, entry_hash FROM audit_logs
                 WHERE workspace_id IS ?1
                 ORDER BY seq DESC LIMIT 1",
                params![event.workspace_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let created_at = crate::util::clamp_monotonic(
            crate::util::format_timestamp_ms(now),
            tip.as_ref().map(|(ts, _)| ts.as_str()),
        );
        let prev_hash = tip
            .map(|(_, hash)| hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let details = event
            .details
            .clone()
            .unwrap_or_else(|| serde_json::json!({}))
            .to_string();

        let entry_hash = compute_entry_hash(
            &prev_hash,
            &id,
            event.workspace_id.as_deref(),
            &event.actor_user_id,
            event.impersonating_user_id.as_deref(),
            &event.action,
            event.resource_type.as_deref(),
            event.resource_id.as_deref(),
            &details,
            event.ip_address.as_deref(),
            event.user_agent.as_deref(),
            &created_at,
        );

        self.conn.execute(
            "INSERT INTO audit_logs (id, workspace_id, actor_user_id, impersonating_user_id,
                action, resource_type, resource_id, details, ip_address, user_agent,
                created_at, prev_hash, entry_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                event.workspace_id,
                event.actor_user_id,
                event.impersonating_user_id,
                event.action,
                event.resource_type,
                event.resource_id,
                details,
                event.ip_address,
                event.user_agent,
                created_at,
                prev_hash,
                entry_hash,
            ],
        )?;

        self.get_audit_event(&id)?
            .ok_or_else(|| DbError::InvalidData(format!("audit event {} not readable after insert", id)))
    }

    pub fn get_audit_event(&self, id: &str) -> Result<Option<DbAuditEvent>, DbError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM audit_logs WHERE id = ?1", AUDIT_COLUMNS),
                params![id],
                Self::map_audit_row,
            )
            .optional()?)
    }

    /// Build the shared WHERE clause for query and export.
    fn audit_filter_sql(filters: &AuditFilters) -> (String, Vec<rusqlite::types::Value>) {
        use rusqlite::types::Value;

        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(ws) = &filters.workspace_id {
            values.push(Value::Text(ws.clone()));
            clauses.push(format!("l.workspace_id = ?{}", values.len()));
        }
        if let Some(actor) = &filters.actor_user_id {
            values.push(Value::Text(actor.clone()));
            clauses.push(format!("l.actor_user_id = ?{}", values.len()));
        }
        if let Some(action) = &filters.action {
            values.push(Value::Text(action.clone()));
            clauses.push(format!("l.action = ?{}", values.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (where_sql, values)
    }

    fn map_audit_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
        let details: String = row.get(5)?;
        Ok(AuditLogEntry {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            action: row.get(2)?,
            resource_type: row.get(3)?,
            resource_id: row.get(4)?,
            details: serde_json::from_str(&details).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?,
            ip_address: row.get(6)?,
            user_agent: row.get(7)?,
            created_at: row.get(8)?,
            actor_email: row.get(9)?,
            actor_name: row.get(10)?,
            impersonating_email: row.get(11)?,
        })
    }

    const AUDIT_ENTRY_SELECT: &'static str =
        "SELECT l.id, l.workspace_id, l.action, l.resource_type, l.resource_id, l.details,
                l.ip_address, l.user_agent, l.created_at,
                actor.email, actor.name, imp.email
         FROM audit_logs l
         LEFT JOIN users actor ON actor.id = l.actor_user_id
         LEFT JOIN users imp ON imp.id = l.impersonating_user_id";

    /// Newest first; ties on `created_at` fall back to insertion order.
    pub fn query_audit_log(
        &self,
        filters: &AuditFilters,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditLogEntry>, DbError> {
        let (where_sql, mut values) = Self::audit_filter_sql(filters);
        values.push(rusqlite::types::Value::Integer(i64::from(limit)));
        let limit_idx = values.len();
        values.push(rusqlite::types::Value::Integer(i64::from(offset)));
        let offset_idx = values.len();

        let sql = format!(
            "{} {} ORDER BY l.created_at DESC, l.seq DESC LIMIT ?{} OFFSET ?{}",
            Self::AUDIT_ENTRY_SELECT,
            where_sql,
            limit_idx,
            offset_idx
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(values.iter()),
            Self::map_audit_entry_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Visit every entry matching `filters` in query order, without paging.
    ///
    /// Rows are streamed from one statement, so the set visited is exactly the
    /// union of every page `query_audit_log` would return for the same filters.
    pub fn for_each_audit_entry<F, E>(&self, filters: &AuditFilters, mut visit: F) -> Result<usize, E>
    where
        F: FnMut(AuditLogEntry) -> Result<(), E>,
        E: From<DbError>,
    {
        let (where_sql, values) = Self::audit_filter_sql(filters);
        let sql = format!(
            "{} {} ORDER BY l.created_at DESC, l.seq DESC",
            Self::AUDIT_ENTRY_SELECT,
            where_sql
        );
        let mut stmt = self.conn.prepare(&sql).map_err(DbError::from)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(values.iter()),
                Self::map_audit_entry_row,
            )
            .map_err(DbError::from)?;

        let mut visited = 0;
        for row in rows {
            visit(row.map_err(DbError::from)?)?;
            visited += 1;
        }
        Ok(visited)
    }

    /// Count ledger events per UTC day for a set of resources in one workspace,
    /// from `since` (inclusive, `YYYY-MM-DD`) onward.
    pub fn count_resource_events_by_day(
        &self,
        workspace_id: &str,
        resource_ids: &[String],
        since: &str,
    ) -> Result<Vec<(String, i64)>, DbError> {
        if resource_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids_json = serde_json::to_string(resource_ids)
            .map_err(|e| DbError::InvalidData(e.to_string()))?;
        let mut stmt = self.conn.prepare(
            "SELECT substr(created_at, 1, 10) AS day, COUNT(*)
             FROM audit_logs
             WHERE workspace_id = ?1
               AND created_at >= ?2
               AND resource_id IN (SELECT value FROM json_each(?3))
             GROUP BY day
             ORDER BY day",
        )?;
        let rows = stmt.query_map(params![workspace_id, since, ids_json], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Recompute the hash chain for one workspace (`None` = global stream).
    pub fn verify_audit_chain(&self, workspace_id: Option<&str>) -> Result<ChainReport, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM audit_logs WHERE workspace_id IS ?1 ORDER BY seq",
            AUDIT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![workspace_id], Self::map_audit_row)?;

        let mut expected_prev = GENESIS_HASH.to_string();
        let mut entries = 0;
        let mut first_broken_seq = None;
        for row in rows {
            let event = row?;
            entries += 1;
            if first_broken_seq.is_none()
                && (event.prev_hash != expected_prev || hash_of(&event) != event.entry_hash)
            {
                first_broken_seq = Some(event.seq);
            }
            expected_prev = event.entry_hash.clone();
        }

        if let Some(seq) = first_broken_seq {
            log::error!(
                "Audit chain broken for workspace {:?} at seq {}",
                workspace_id,
                seq
            );
        }

        Ok(ChainReport {
            workspace_id: workspace_id.map(str::to_string),
            entries,
            ok: first_broken_seq.is_none(),
            first_broken_seq,
        })
    }

    /// Privileged: permanently delete a workspace's audit history.
    ///
    /// The erasure is recorded on the global stream first; the delete trigger
    /// only lets a workspace's rows go once such an event sits after its last
    /// entry. Both happen in one transaction. Returns the number of rows removed.
    pub fn erase_workspace_audit(
        &self,
        authorization: &ErasureAuthorization,
        workspace_id: &str,
    ) -> Result<usize, DbError> {
        if authorization.authorized_by.trim().is_empty() || authorization.reason.trim().is_empty() {
            return Err(DbError::InvalidData(
                "erasure requires an approver and a reason".to_string(),
            ));
        }

        log::warn!(
            "Erasing audit history for workspace {} (authorized by {}: {})",
            workspace_id,
            authorization.authorized_by,
            authorization.reason
        );

        self.with_transaction(|db| {
            let doomed: i64 = db.conn.query_row(
                "SELECT COUNT(*) FROM audit_logs WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )?;

            db.append_audit_event(
                &NewAuditEvent {
                    actor_user_id: authorization.authorized_by.clone(),
                    action: ERASURE_ACTION.to_string(),
                    resource_type: Some("workspace".to_string()),
                    resource_id: Some(workspace_id.to_string()),
                    details: Some(serde_json::json!({
                        "deletedCount": doomed,
                        "reason": authorization.reason,
                    })),
                    ..Default::default()
                },
                Utc::now(),
            )?;

            let deleted = db.conn.execute(
                "DELETE FROM audit_logs WHERE workspace_id = ?1",
                params![workspace_id],
            )?;
            if deleted as i64 != doomed {
                return Err(DbError::Integrity(format!(
                    "erasure of {} removed {} rows, expected {}",
                    workspace_id, deleted, doomed
                )));
            }
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::*;
    use super::*;
    use chrono::{Duration, TimeZone};

    fn event(ws: &str, action: &str) -> NewAuditEvent {
        NewAuditEvent {
            workspace_id: Some(ws.to_string()),
            actor_user_id: "u1".to_string(),
            action: action.to_string(),
            resource_type: Some("document".to_string()),
            resource_id: Some("doc-1".to_string()),
            details: Some(serde_json::json!({"k": "v"})),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_assigns_ms_utc_timestamp() {
        let db = test_db();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let stored = db.record_audit_event_at(&event("ws", "document.created"), at).unwrap();
        assert_eq!(stored.created_at, "2024-01-01T00:00:00.000Z");
        assert_eq!(stored.prev_hash, GENESIS_HASH);
        assert_eq!(stored.entry_hash.len(), 64);
    }

    #[test]
    fn test_timestamps_never_go_backwards_within_workspace() {
        let db = test_db();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let e1 = db.record_audit_event_at(&event("ws", "a"), t1).unwrap();
        // Clock stepped back five seconds.
        let e2 = db
            .record_audit_event_at(&event("ws", "b"), t1 - Duration::seconds(5))
            .unwrap();
        assert!(e1.created_at <= e2.created_at);
        assert_eq!(e2.created_at, e1.created_at);

        // Another workspace has its own clock floor.
        let other = db
            .record_audit_event_at(&event("ws-2", "c"), t1 - Duration::seconds(5))
            .unwrap();
        assert_eq!(other.created_at, "2024-01-01T11:59:55.000Z");
    }

    #[test]
    fn test_update_rejected_by_storage() {
        let db = test_db();
        let stored = db.record_audit_event(&event("ws", "login")).unwrap();

        let err = db
            .conn_ref()
            .execute("UPDATE audit_logs SET action = 'tampered' WHERE id = ?1", [&stored.id])
            .map_err(DbError::from)
            .unwrap_err();
        assert!(matches!(err, DbError::ImmutableLedger(_)), "got {:?}", err);

        let after = db.get_audit_event(&stored.id).unwrap().unwrap();
        assert_eq!(after, stored);
    }

    #[test]
    fn test_delete_rejected_by_storage() {
        let db = test_db();
        let stored = db.record_audit_event(&event("ws", "login")).unwrap();

        let err = db
            .conn_ref()
            .execute("DELETE FROM audit_logs WHERE id = ?1", [&stored.id])
            .map_err(DbError::from)
            .unwrap_err();
        assert!(matches!(err, DbError::ImmutableLedger(_)));

        let global = db
            .record_audit_event(&NewAuditEvent {
                actor_user_id: "root".into(),
                action: "system.boot".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(db
            .conn_ref()
            .execute("DELETE FROM audit_logs WHERE id = ?1", [&global.id])
            .is_err());
        assert!(db.get_audit_event(&stored.id).unwrap().is_some());
    }

    #[test]
    fn test_backdated_direct_insert_rejected() {
        let db = test_db();
        let t1 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        db.record_audit_event_at(&event("ws", "a"), t1).unwrap();
        let result = db.conn_ref().execute(
            "INSERT INTO audit_logs (id, workspace_id, actor_user_id, action, created_at,
                prev_hash, entry_hash)
             VALUES ('forged', 'ws', 'u1', 'x', '2020-01-01T00:00:00.000Z', '', '')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_record_is_idempotent_by_id() {
        let db = test_db();
        let mut ev = event("ws", "document.updated");
        ev.id = Some("evt-fixed".to_string());
        let first = db.record_audit_event(&ev).unwrap();
        let second = db.record_audit_event(&ev).unwrap();
        assert_eq!(first, second);
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM audit_logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reused_id_in_other_workspace_is_a_collision() {
        let db = test_db();
        let mut ev = event("ws-a", "permission.changed");
        ev.id = Some("evt-1".to_string());
        ev.details = Some(serde_json::json!({"secret": "ws-a-only"}));
        db.record_audit_event(&ev).unwrap();

        let mut foreign = event("ws-b", "login");
        foreign.id = Some("evt-1".to_string());
        let err = db.record_audit_event(&foreign).unwrap_err();
        assert!(matches!(err, DbError::Integrity(_)), "got {:?}", err);
        assert!(!err.to_string().contains("ws-a-only"));

        let mut global = event("ws", "system.boot");
        global.workspace_id = None;
        global.id = Some("evt-1".to_string());
        assert!(db.record_audit_event(&global).is_err());

        let stored = db.get_audit_event("evt-1").unwrap().unwrap();
        assert_eq!(stored.workspace_id.as_deref(), Some("ws-a"));
    }

    #[test]
    fn test_query_orders_desc_with_stable_ties() {
        let db = test_db();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let e1 = db.record_audit_event_at(&event("ws", "first"), t).unwrap();
        let e2 = db.record_audit_event_at(&event("ws", "second"), t).unwrap();
        assert_eq!(e1.created_at, e2.created_at);

        let rows = db
            .query_audit_log(&AuditFilters { workspace_id: Some("ws".into()), ..Default::default() }, 10, 0)
            .unwrap();
        let actions: Vec<&str> = rows.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, vec!["second", "first"]);
    }

    #[test]
    fn test_paging_150_events_has_no_gaps_or_repeats() {
        let db = test_db();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..150 {
            // Pairs share a millisecond to exercise the tie-breaker.
            let at = start + Duration::milliseconds((i / 2) as i64);
            db.record_audit_event_at(&event("ws", &format!("a{}", i)), at).unwrap();
        }
        let filters = AuditFilters { workspace_id: Some("ws".into()), ..Default::default() };
        let page1 = db.query_audit_log(&filters, 100, 0).unwrap();
        let page2 = db.query_audit_log(&filters, 100, 100).unwrap();
        assert_eq!(page1.len(), 100);
        assert_eq!(page2.len(), 50);
        assert_eq!(page1[0].action, "a149");

        let mut ids: Vec<String> = page1.iter().chain(page2.iter()).map(|e| e.id.clone()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 150);

        let all: Vec<&AuditLogEntry> = page1.iter().chain(page2.iter()).collect();
        for pair in all.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[test]
    fn test_query_joins_actor_and_impersonator() {
        let db = test_db();
        seed_user(&db, "admin", "admin@example.com", "Admin");
        seed_user(&db, "u1", "u1@example.com", "User One");
        let mut ev = event("ws", "document.deleted");
        ev.actor_user_id = "admin".into();
        ev.impersonating_user_id = Some("u1".into());
        db.record_audit_event(&ev).unwrap();

        let rows = db.query_audit_log(&AuditFilters::default(), 10, 0).unwrap();
        assert_eq!(rows[0].actor_email.as_deref(), Some("admin@example.com"));
        assert_eq!(rows[0].actor_name.as_deref(), Some("Admin"));
        assert_eq!(rows[0].impersonating_email.as_deref(), Some("u1@example.com"));
    }

    #[test]
    fn test_query_filters_by_actor_and_action() {
        let db = test_db();
        db.record_audit_event(&event("ws", "login")).unwrap();
        let mut other = event("ws", "logout");
        other.actor_user_id = "u2".into();
        db.record_audit_event(&other).unwrap();

        let by_actor = db
            .query_audit_log(&AuditFilters { actor_user_id: Some("u2".into()), ..Default::default() }, 10, 0)
            .unwrap();
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].action, "logout");

        let by_action = db
            .query_audit_log(&AuditFilters { action: Some("login".into()), ..Default::default() }, 10, 0)
            .unwrap();
        assert_eq!(by_action.len(), 1);
    }

    #[test]
    fn test_verify_chain_detects_tampering_via_trigger_bypass() {
        let db = test_db();
        for i in 0..3 {
            db.record_audit_event(&event("ws", &format!("a{}", i))).unwrap();
        }
        let report = db.verify_audit_chain(Some("ws")).unwrap();
        assert!(report.ok);
        assert_eq!(report.entries, 3);

        // Simulate an attacker with schema access dropping the guard.
        db.conn_ref()
            .execute_batch(
                "DROP TRIGGER audit_logs_no_update;
                 UPDATE audit_logs SET action = 'forged' WHERE action = 'a1';",
            )
            .unwrap();
        let report = db.verify_audit_chain(Some("ws")).unwrap();
        assert!(!report.ok);
        assert_eq!(report.first_broken_seq, Some(2));
    }

    #[test]
    fn test_erasure_is_privileged_and_audited() {
        let db = test_db();
        db.record_audit_event(&event("ws-gone", "a")).unwrap();
        db.record_audit_event(&event("ws-gone", "b")).unwrap();
        db.record_audit_event(&event("ws-kept", "c")).unwrap();

        let auth = ErasureAuthorization {
            authorized_by: "dpo@example.com".into(),
            reason: "GDPR erasure request".into(),
        };
        assert_eq!(db.erase_workspace_audit(&auth, "ws-gone").unwrap(), 2);

        let remaining: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM audit_logs WHERE workspace_id = 'ws-gone'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(db.verify_audit_chain(Some("ws-kept")).unwrap().entries, 1);
        assert!(db.verify_audit_chain(None).unwrap().ok);

        let trail = db
            .query_audit_log(&AuditFilters { action: Some(ERASURE_ACTION.into()), ..Default::default() }, 10, 0)
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].details["deletedCount"], 2);
        assert!(trail[0].workspace_id.is_none());

        // The erasure event does not cover rows written after it.
        db.record_audit_event(&event("ws-gone", "d")).unwrap();
        assert!(db
            .conn_ref()
            .execute("DELETE FROM audit_logs WHERE workspace_id = 'ws-gone'", [])
            .is_err());
        assert!(db
            .conn_ref()
            .execute("DELETE FROM audit_logs WHERE workspace_id = 'ws-kept'", [])
            .is_err());

        // Nor can the erasure record itself be removed.
        let err = db
            .conn_ref()
            .execute("DELETE FROM audit_logs WHERE workspace_id IS NULL", [])
            .map_err(DbError::from)
            .unwrap_err();
        assert!(matches!(err, DbError::ImmutableLedger(_)));
    }

    #[test]
    fn test_adhoc_delete_without_ledgered_erasure_rejected() {
        let db = test_db();
        db.record_audit_event(&event("ws", "a")).unwrap();
        db.record_audit_event(&event("ws", "b")).unwrap();

        // A hand-made permission table has no say over the trigger.
        let err = db
            .conn_ref()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS audit_erasure_grants (workspace_id TEXT PRIMARY KEY);
                 INSERT INTO audit_erasure_grants VALUES ('ws');
                 DELETE FROM audit_logs WHERE workspace_id = 'ws';",
            )
            .map_err(DbError::from)
            .unwrap_err();
        assert!(matches!(err, DbError::ImmutableLedger(_)), "got {:?}", err);

        let report = db.verify_audit_chain(Some("ws")).unwrap();
        assert!(report.ok);
        assert_eq!(report.entries, 2);
    }

    #[test]
    fn test_erasure_event_for_other_workspace_unlocks_nothing() {
        let db = test_db();
        db.record_audit_event(&event("ws", "a")).unwrap();
        db.record_audit_event(&event("ws-other", "b")).unwrap();
        let auth = ErasureAuthorization { authorized_by: "ops".into(), reason: "closed".into() };
        db.erase_workspace_audit(&auth, "ws-other").unwrap();

        assert!(db
            .conn_ref()
            .execute("DELETE FROM audit_logs WHERE workspace_id = 'ws'", [])
            .is_err());
        assert_eq!(db.verify_audit_chain(Some("ws")).unwrap().entries, 1);
    }

    #[test]
    fn test_erasure_requires_authorization_fields() {
        let db = test_db();
        let auth = ErasureAuthorization { authorized_by: " ".into(), reason: "x".into() };
        assert!(db.erase_workspace_audit(&auth, "ws").is_err());
    }

    #[test]
    fn test_count_resource_events_by_day() {
        let db = test_db();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 23, 59, 59).unwrap();
        db.record_audit_event_at(&event("ws", "a"), day1).unwrap();
        db.record_audit_event_at(&event("ws", "b"), day2).unwrap();
        db.record_audit_event_at(&event("ws", "c"), day2).unwrap();
        let mut unrelated = event("ws", "d");
        unrelated.resource_id = Some("other".into());
        db.record_audit_event_at(&unrelated, day2).unwrap();

        let counts = db
            .count_resource_events_by_day("ws", &["doc-1".to_string()], "2024-03-01")
            .unwrap();
        assert_eq!(
            counts,
            vec![("2024-03-01".to_string(), 1), ("2024-03-02".to_string(), 2)]
        );
        assert!(db
            .count_resource_events_by_day("ws", &["doc-1".to_string()], "2024-03-02")
            .unwrap()
            .iter()
            .all(|(d, _)| d == "2024-03-02"));
    }
}
