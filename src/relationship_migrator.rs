//! Fold legacy single-valued relationship columns into `document_associations`.
//!
//! Older databases carry `parent_id`, `program_id`, `project_id` and
//! `sprint_id` directly on `documents`. Each column is migrated as an
//! independent step: guarded by a column-exists check, run in its own
//! transaction, and reported on its own. Inserts go through
//! `ON CONFLICT DO NOTHING`, so re-running is a no-op and an edge someone
//! created by hand is never overwritten.

use std::time::Instant;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::{CoreDb, DbError};
use crate::entity::RelationshipType;

/// Migration order: containers first, so a partially migrated database still
/// resolves the outer levels of a roll-up.
const STEP_ORDER: [RelationshipType; 4] = [
    RelationshipType::Program,
    RelationshipType::Project,
    RelationshipType::Sprint,
    RelationshipType::Parent,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum StepOutcome {
    #[serde(rename_all = "camelCase")]
    Completed {
        scanned: usize,
        inserted: usize,
        already_present: usize,
        orphaned: usize,
    },
    /// The legacy column is not present in this schema.
    Skipped { reason: String },
    Failed { error: String },
    /// Deadline passed before this step started. Re-running picks it up.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnReport {
    pub column: &'static str,
    pub relationship_type: RelationshipType,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub steps: Vec<ColumnReport>,
}

impl MigrationReport {
    pub fn inserted_total(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s.outcome {
                StepOutcome::Completed { inserted, .. } => inserted,
                _ => 0,
            })
            .sum()
    }

    pub fn has_failures(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }

    pub fn was_cancelled(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.outcome, StepOutcome::Cancelled))
    }

    pub fn step(&self, relationship_type: RelationshipType) -> Option<&ColumnReport> {
        self.steps
            .iter()
            .find(|s| s.relationship_type == relationship_type)
    }

    /// One line per column, e.g. `sprint_id: scanned=3 inserted=2 present=1 orphaned=0`.
    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(|s| {
                let detail = match &s.outcome {
                    StepOutcome::Completed {
                        scanned,
                        inserted,
                        already_present,
                        orphaned,
                    } => format!(
                        "scanned={} inserted={} present={} orphaned={}",
                        scanned, inserted, already_present, orphaned
                    ),
                    StepOutcome::Skipped { reason } => format!("skipped ({})", reason),
                    StepOutcome::Failed { error } => format!("FAILED ({})", error),
                    StepOutcome::Cancelled => "cancelled".to_string(),
                };
                format!("{}: {}", s.column, detail)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Run every legacy column step. Never fails as a whole: each step's error is
/// captured in its report entry.
pub fn migrate_legacy_relationships(conn: &Connection, deadline: Option<Instant>) -> MigrationReport {
    let mut report = MigrationReport::default();

    for relationship_type in STEP_ORDER {
        let column = relationship_type.legacy_column();

        if deadline.is_some_and(|d| Instant::now() >= d) {
            report.steps.push(ColumnReport {
                column,
                relationship_type,
                outcome: StepOutcome::Cancelled,
            });
            continue;
        }

        let outcome = match CoreDb::column_exists(conn, "documents", column) {
            Ok(false) => StepOutcome::Skipped {
                reason: "column not present".to_string(),
            },
            Ok(true) => match migrate_column(conn, relationship_type) {
                Ok(outcome) => {
                    log::info!("Relationship migration {}: {:?}", column, outcome);
                    outcome
                }
                Err(e) => {
                    log::error!("Relationship migration {} failed: {}", column, e);
                    StepOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            },
            Err(e) => {
                log::error!("Relationship migration {}: schema probe failed: {}", column, e);
                StepOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        report.steps.push(ColumnReport {
            column,
            relationship_type,
            outcome,
        });
    }

    report
}

fn migrate_column(
    conn: &Connection,
    relationship_type: RelationshipType,
) -> Result<StepOutcome, DbError> {
    let column = relationship_type.legacy_column();
    let tx = conn.unchecked_transaction()?;

    // Target must exist in the same workspace; anything else is orphaned.
    let candidates: Vec<(String, String, bool)> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT d.id, d.{col},
                    EXISTS (SELECT 1 FROM documents t
                            WHERE t.id = d.{col} AND t.workspace_id = d.workspace_id)
             FROM documents d
             WHERE d.{col} IS NOT NULL AND d.{col} != ''
             ORDER BY d.id",
            col = column
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let metadata = serde_json::json!({
        "migratedFrom": column,
        "migratedAt": crate::util::now_timestamp_ms(),
    })
    .to_string();

    let mut inserted = 0;
    let mut already_present = 0;
    let mut orphaned = 0;
    {
        let mut insert = tx.prepare(
            "INSERT INTO document_associations
                (document_id, related_id, relationship_type, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(document_id, related_id, relationship_type) DO NOTHING",
        )?;
        for (document_id, related_id, target_ok) in &candidates {
            if !target_ok {
                log::warn!(
                    "Skipping orphaned {} on {}: {} not found in workspace",
                    column,
                    document_id,
                    related_id
                );
                orphaned += 1;
                continue;
            }
            let changed = insert.execute(params![
                document_id,
                related_id,
                relationship_type.as_str(),
                metadata,
                crate::util::now_timestamp_ms(),
            ])?;
            if changed > 0 {
                inserted += 1;
            } else {
                already_present += 1;
            }
        }
    }

    tx.commit()?;

    Ok(StepOutcome::Completed {
        scanned: candidates.len(),
        inserted,
        already_present,
        orphaned,
    })
}
