//! CSV rendering of the audit ledger.
//!
//! Quoting follows RFC 4180: a field containing a comma, quote, CR or LF is
//! wrapped in double quotes with inner quotes doubled. Rows are written as
//! they stream out of storage.

use std::io::Write;

use crate::db::{AuditFilters, AuditLogEntry, CoreDb};
use crate::error::CoreError;

pub const CSV_HEADER: [&str; 12] = [
    "id",
    "createdAt",
    "workspaceId",
    "actorEmail",
    "actorName",
    "impersonatingEmail",
    "action",
    "resourceType",
    "resourceId",
    "ipAddress",
    "userAgent",
    "details",
];

pub fn escape_csv_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn write_row<W: Write>(out: &mut W, fields: &[&str]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|f| escape_csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(b"\r\n")
}

fn entry_fields(entry: &AuditLogEntry) -> [String; 12] {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    [
        entry.id.clone(),
        entry.created_at.clone(),
        opt(&entry.workspace_id),
        opt(&entry.actor_email),
        opt(&entry.actor_name),
        opt(&entry.impersonating_email),
        entry.action.clone(),
        opt(&entry.resource_type),
        opt(&entry.resource_id),
        opt(&entry.ip_address),
        opt(&entry.user_agent),
        entry.details.to_string(),
    ]
}

/// Write every entry matching `filters` (no pagination) as CSV.
/// Returns the number of data rows written.
pub fn export_csv<W: Write>(
    db: &CoreDb,
    filters: &AuditFilters,
    out: &mut W,
) -> Result<usize, CoreError> {
    let io_err = |e: std::io::Error| CoreError::Internal(format!("export write failed: {}", e));

    write_row(out, &CSV_HEADER).map_err(io_err)?;
    let rows = db.for_each_audit_entry(filters, |entry| {
        let fields = entry_fields(&entry);
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        write_row(out, &refs).map_err(io_err)
    })?;
    out.flush().map_err(io_err)?;
    Ok(rows)
}
