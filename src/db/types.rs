//! Shared type definitions for the database layer.

use rusqlite::ffi;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::RelationshipType;

/// Message raised by the audit immutability triggers.
pub const APPEND_ONLY_MESSAGE: &str = "audit_logs is append-only";

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    /// A row references a document that does not exist.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// The storage engine rejected an UPDATE/DELETE on the audit ledger.
    #[error("Audit ledger rejected mutation: {0}")]
    ImmutableLedger(String),

    /// Transient lock contention; safe to retry.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref code, ref message) = err {
            let text = message.clone().unwrap_or_else(|| code.to_string());
            if code.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                return DbError::Integrity(text);
            }
            if text.contains(APPEND_ONLY_MESSAGE) {
                return DbError::ImmutableLedger(text);
            }
            if code.extended_code == ffi::SQLITE_CONSTRAINT_TRIGGER {
                return DbError::Integrity(text);
            }
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return DbError::Busy(text);
            }
        }
        DbError::Sqlite(err)
    }
}

/// A row from the `documents` table, reduced to what the core reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDocument {
    pub id: String,
    pub workspace_id: String,
    pub document_type: String,
    pub title: String,
    /// Free-form JSON owned by collaborators.
    pub properties: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from `document_associations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAssociation {
    pub id: i64,
    pub document_id: String,
    pub related_id: String,
    pub relationship_type: RelationshipType,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

/// A document holding more edges of a single-valued type than convention allows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardinalityViolation {
    pub document_id: String,
    pub relationship_type: RelationshipType,
    pub edge_count: i64,
}

/// Input for `AuditLedger::record`.
#[derive(Debug, Clone, Default)]
pub struct NewAuditEvent {
    /// Caller-assigned id; makes a retried record idempotent. Generated when `None`.
    pub id: Option<String>,
    pub workspace_id: Option<String>,
    pub actor_user_id: String,
    pub impersonating_user_id: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A row from `audit_logs`, as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAuditEvent {
    pub seq: i64,
    pub id: String,
    pub workspace_id: Option<String>,
    pub actor_user_id: String,
    pub impersonating_user_id: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// `YYYY-MM-DDTHH:MM:SS.mmmZ`
    pub created_at: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// An audit row joined with actor identities, as returned to the route layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub workspace_id: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: String,
    pub actor_email: Option<String>,
    pub actor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonating_email: Option<String>,
}

/// Filters shared by audit query and export.
#[derive(Debug, Clone, Default)]
pub struct AuditFilters {
    pub workspace_id: Option<String>,
    pub actor_user_id: Option<String>,
    pub action: Option<String>,
}

/// Result of recomputing a workspace's hash chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub workspace_id: Option<String>,
    pub entries: usize,
    pub ok: bool,
    /// `seq` of the first entry whose hash does not match.
    pub first_broken_seq: Option<i64>,
}
