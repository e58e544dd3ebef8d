//! Trailing 30-day activity roll-ups for programs, projects and sprints.
//!
//! An entity's activity is every ledger event in its workspace whose
//! `resource_id` is the entity itself or one of its descendants. Descendants
//! are found by walking association edges inward one relationship type per
//! hop (see `descendant_chain`), so a document reachable through several
//! edges still counts once.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::db::CoreDb;
use crate::entity::{ActivityEntityType, RelationshipType};
use crate::error::CoreError;
use crate::workspace::{validate_id, RequestContext};

/// Number of daily buckets returned, today included.
pub const WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityBucket {
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityResult {
    pub days: Vec<ActivityBucket>,
}

/// Relationship types followed from the entity outward, one per hop.
pub fn descendant_chain(entity_type: ActivityEntityType) -> &'static [RelationshipType] {
    match entity_type {
        ActivityEntityType::Program => &[
            RelationshipType::Program,
            RelationshipType::Project,
            RelationshipType::Sprint,
        ],
        ActivityEntityType::Project => &[RelationshipType::Project, RelationshipType::Sprint],
        ActivityEntityType::Sprint => &[RelationshipType::Sprint],
    }
}

/// Activity for the 30 days ending today (UTC).
pub fn compute(
    db: &CoreDb,
    ctx: &RequestContext,
    entity_type: &str,
    entity_id: &str,
) -> Result<ActivityResult, CoreError> {
    compute_as_of(db, ctx, entity_type, entity_id, Utc::now().date_naive())
}

/// Activity for the 30 days ending on `today`.
pub fn compute_as_of(
    db: &CoreDb,
    ctx: &RequestContext,
    entity_type: &str,
    entity_id: &str,
    today: NaiveDate,
) -> Result<ActivityResult, CoreError> {
    ctx.validate()?;
    let entity_type = ActivityEntityType::parse(entity_type)
        .ok_or_else(|| CoreError::InvalidArgument("invalid entity type".to_string()))?;
    validate_id("entity", entity_id)?;

    let entity = db
        .get_document_scoped(&ctx.workspace_id, entity_id)?
        .ok_or(CoreError::NotFound)?;
    if entity.document_type != entity_type.document_type() {
        return Err(CoreError::NotFound);
    }

    let members = db.resolve_descendants(
        &ctx.workspace_id,
        entity_id,
        descendant_chain(entity_type),
    )?;

    let first_day = today - Duration::days(WINDOW_DAYS - 1);
    let counts: HashMap<String, i64> = db
        .count_resource_events_by_day(
            &ctx.workspace_id,
            &members,
            &first_day.format("%Y-%m-%d").to_string(),
        )?
        .into_iter()
        .collect();

    let days = (0..WINDOW_DAYS)
        .map(|offset| {
            let date = (first_day + Duration::days(offset)).format("%Y-%m-%d").to_string();
            let count = counts.get(&date).copied().unwrap_or(0);
            ActivityBucket { date, count }
        })
        .collect();

    log::debug!(
        "Activity for {} {}: {} member documents",
        entity_type.as_str(),
        entity_id,
        members.len()
    );

    Ok(ActivityResult { days })
}
