//! Async facade over the blocking storage core.
//!
//! Every call takes a `RequestContext`, runs its storage work on tokio's
//! blocking pool under the connection lock, and is bounded by the caller's
//! deadline. Retryable failures (busy/locked database) are retried with
//! backoff; every write is idempotent, so a retry after an ambiguous failure
//! cannot duplicate an edge or an audit entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::activity::{self, ActivityResult};
use crate::audit_export;
use crate::config::CoreConfig;
use crate::db::{
    AuditFilters, AuditLogEntry, CardinalityViolation, ChainReport, CoreDb, DbAssociation,
    DbAuditEvent, NewAuditEvent,
};
use crate::entity::RelationshipType;
use crate::error::CoreError;
use crate::relationship_migrator::{self, MigrationReport};
use crate::retry::{retry_delay, RetryPolicy};
use crate::workspace::{validate_id, RequestContext};

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Absolute point after which the caller stops waiting.
    pub deadline: Option<Instant>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Time left before the deadline; `Err(Timeout)` once it has passed.
    fn remaining(&self) -> Result<Option<Duration>, CoreError> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(CoreError::Timeout)
                } else {
                    Ok(Some(left))
                }
            }
        }
    }
}

/// What happens to the parent action when its audit record cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditPolicy {
    /// The action fails (and rolls back) with the audit error.
    Required,
    /// The failure is logged and the action proceeds unaudited.
    BestEffort,
}

/// An action to record on behalf of the caller.
#[derive(Debug, Clone, Default)]
pub struct AuditAction {
    /// Supply to make a retried record idempotent.
    pub id: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    /// Only honoured for super admins; everyone else sees their own workspace.
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub actor_user_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

impl AuditQuery {
    fn filters(&self, ctx: &RequestContext) -> AuditFilters {
        AuditFilters {
            workspace_id: ctx.audit_read_scope(self.workspace_id.as_deref()),
            actor_user_id: self.actor_user_id.clone(),
            action: self.action.clone(),
        }
    }
}

fn event_for(ctx: &RequestContext, id: String, action: &str) -> NewAuditEvent {
    NewAuditEvent {
        id: Some(id),
        workspace_id: Some(ctx.workspace_id.clone()),
        actor_user_id: ctx.actor_user_id.clone(),
        impersonating_user_id: ctx.impersonating_user_id.clone(),
        action: action.to_string(),
        ip_address: ctx.ip_address.clone(),
        user_agent: ctx.user_agent.clone(),
        ..Default::default()
    }
}

/// Record `event`, applying `policy` to a failure.
fn record_with_policy(
    db: &CoreDb,
    event: &NewAuditEvent,
    policy: AuditPolicy,
) -> Result<Option<DbAuditEvent>, CoreError> {
    match db.record_audit_event(event) {
        Ok(stored) => Ok(Some(stored)),
        Err(e) => match policy {
            AuditPolicy::Required => Err(e.into()),
            AuditPolicy::BestEffort => {
                log::warn!("Best-effort audit '{}' not recorded: {}", event.action, e);
                Ok(None)
            }
        },
    }
}

fn parse_relationship(raw: &str) -> Result<RelationshipType, CoreError> {
    RelationshipType::parse(raw)
        .ok_or_else(|| CoreError::InvalidArgument("invalid relationship type".to_string()))
}

/// Both endpoints must exist in the caller's workspace.
fn require_document(db: &CoreDb, ctx: &RequestContext, id: &str) -> Result<(), CoreError> {
    db.get_document_scoped(&ctx.workspace_id, id)?
        .map(|_| ())
        .ok_or(CoreError::NotFound)
}

pub struct CoreService {
    db: Arc<Mutex<CoreDb>>,
    config: CoreConfig,
    retry: RetryPolicy,
}

impl CoreService {
    /// Open the configured database and wrap it.
    pub fn open(config: CoreConfig) -> Result<Self, CoreError> {
        let db = CoreDb::open(&config)?;
        Ok(Self::from_db(db, config))
    }

    pub fn from_db(db: CoreDb, config: CoreConfig) -> Self {
        let retry = config.retry_policy();
        Self {
            db: Arc::new(Mutex::new(db)),
            config,
            retry,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Run `f` against the database on the blocking pool.
    async fn run<T, F>(&self, opts: CallOptions, op: &'static str, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: Fn(&CoreDb) -> Result<T, CoreError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            let remaining = opts.remaining()?;
            let db = Arc::clone(&self.db);
            let job = Arc::clone(&f);
            let handle = tokio::task::spawn_blocking(move || {
                let guard = db.lock();
                job(&guard)
            });

            let joined = match remaining {
                Some(left) => tokio::time::timeout(left, handle).await.map_err(|_| {
                    log::warn!("{} exceeded its deadline", op);
                    CoreError::Timeout
                })?,
                None => handle.await,
            };
            let result =
                joined.map_err(|e| CoreError::Internal(format!("{} task failed: {}", op, e)))?;

            match result {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = retry_delay(attempt, &self.retry);
                    log::warn!(
                        "{} retry {}/{} after {} (sleep {:?})",
                        op,
                        attempt,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // =========================================================================
    // Associations
    // =========================================================================

    /// Attach `document_id` to `related_id`. Re-linking an existing edge
    /// returns it unchanged and records nothing.
    #[allow(clippy::too_many_arguments)]
    pub async fn link(
        &self,
        ctx: &RequestContext,
        document_id: &str,
        related_id: &str,
        relationship_type: &str,
        metadata: serde_json::Value,
        policy: AuditPolicy,
        opts: CallOptions,
    ) -> Result<DbAssociation, CoreError> {
        ctx.validate()?;
        validate_id("document", document_id)?;
        validate_id("related", related_id)?;
        let rt = parse_relationship(relationship_type)?;

        let ctx = ctx.clone();
        let document_id = document_id.to_string();
        let related_id = related_id.to_string();
        let event_id = uuid::Uuid::new_v4().to_string();

        self.run(opts, "link", move |db| {
            db.with_transaction(|tx| -> Result<_, CoreError> {
                require_document(tx, &ctx, &document_id)?;
                require_document(tx, &ctx, &related_id)?;

                match tx.insert_association(&document_id, &related_id, rt, &metadata)? {
                    Some(created) => {
                        let mut event = event_for(&ctx, event_id.clone(), "association.created");
                        event.resource_type = Some("document".to_string());
                        event.resource_id = Some(document_id.clone());
                        event.details = Some(json!({
                            "relatedId": related_id,
                            "relationshipType": rt.as_str(),
                        }));
                        record_with_policy(tx, &event, policy)?;
                        Ok(created)
                    }
                    None => tx
                        .get_association(&document_id, &related_id, rt)?
                        .ok_or_else(|| CoreError::Internal("edge vanished after conflict".into())),
                }
            })
        })
        .await
    }

    /// Replace every `relationship_type` edge on `document_id` with one edge
    /// to `new_related_id`, in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn relink(
        &self,
        ctx: &RequestContext,
        document_id: &str,
        new_related_id: &str,
        relationship_type: &str,
        metadata: serde_json::Value,
        policy: AuditPolicy,
        opts: CallOptions,
    ) -> Result<DbAssociation, CoreError> {
        ctx.validate()?;
        validate_id("document", document_id)?;
        validate_id("related", new_related_id)?;
        let rt = parse_relationship(relationship_type)?;

        let ctx = ctx.clone();
        let document_id = document_id.to_string();
        let new_related_id = new_related_id.to_string();
        let event_id = uuid::Uuid::new_v4().to_string();

        self.run(opts, "relink", move |db| {
            db.with_transaction(|tx| -> Result<_, CoreError> {
                require_document(tx, &ctx, &document_id)?;
                require_document(tx, &ctx, &new_related_id)?;

                let previous: Vec<String> = tx
                    .list_associations_by_document(&document_id, Some(rt))?
                    .into_iter()
                    .map(|a| a.related_id)
                    .collect();
                tx.delete_associations_by_document(&document_id, Some(rt))?;
                let edge = tx.upsert_association(&document_id, &new_related_id, rt, &metadata)?;

                let mut event = event_for(&ctx, event_id.clone(), "association.relinked");
                event.resource_type = Some("document".to_string());
                event.resource_id = Some(document_id.clone());
                event.details = Some(json!({
                    "relationshipType": rt.as_str(),
                    "previousRelatedIds": previous,
                    "relatedId": new_related_id,
                }));
                record_with_policy(tx, &event, policy)?;
                Ok(edge)
            })
        })
        .await
    }

    /// Remove `document_id`'s outgoing edges, optionally of one type only.
    pub async fn unlink_document(
        &self,
        ctx: &RequestContext,
        document_id: &str,
        relationship_type: Option<&str>,
        policy: AuditPolicy,
        opts: CallOptions,
    ) -> Result<usize, CoreError> {
        ctx.validate()?;
        validate_id("document", document_id)?;
        let rt = relationship_type.map(parse_relationship).transpose()?;

        let ctx = ctx.clone();
        let document_id = document_id.to_string();
        let event_id = uuid::Uuid::new_v4().to_string();

        self.run(opts, "unlink", move |db| {
            db.with_transaction(|tx| -> Result<_, CoreError> {
                require_document(tx, &ctx, &document_id)?;
                let removed = tx.delete_associations_by_document(&document_id, rt)?;
                if removed > 0 {
                    let mut event = event_for(&ctx, event_id.clone(), "association.deleted");
                    event.resource_type = Some("document".to_string());
                    event.resource_id = Some(document_id.clone());
                    event.details = Some(json!({
                        "relationshipType": rt.map(|r| r.as_str()),
                        "removed": removed,
                    }));
                    record_with_policy(tx, &event, policy)?;
                }
                Ok(removed)
            })
        })
        .await
    }

    /// Edges from `document_id`, in insertion order.
    pub async fn list_associations(
        &self,
        ctx: &RequestContext,
        document_id: &str,
        relationship_type: Option<&str>,
        opts: CallOptions,
    ) -> Result<Vec<DbAssociation>, CoreError> {
        ctx.validate()?;
        validate_id("document", document_id)?;
        let rt = relationship_type.map(parse_relationship).transpose()?;
        let ctx = ctx.clone();
        let document_id = document_id.to_string();

        self.run(opts, "list_associations", move |db| {
            require_document(db, &ctx, &document_id)?;
            Ok(db.list_associations_by_document(&document_id, rt)?)
        })
        .await
    }

    /// Edges pointing at `related_id`, limited to sources in the caller's workspace.
    pub async fn list_members(
        &self,
        ctx: &RequestContext,
        related_id: &str,
        relationship_type: Option<&str>,
        opts: CallOptions,
    ) -> Result<Vec<DbAssociation>, CoreError> {
        ctx.validate()?;
        validate_id("related", related_id)?;
        let rt = relationship_type.map(parse_relationship).transpose()?;
        let ctx = ctx.clone();
        let related_id = related_id.to_string();

        self.run(opts, "list_members", move |db| {
            require_document(db, &ctx, &related_id)?;
            let mut members = Vec::new();
            for edge in db.list_associations_by_related(&related_id, rt)? {
                if db.get_document_scoped(&ctx.workspace_id, &edge.document_id)?.is_some() {
                    members.push(edge);
                }
            }
            Ok(members)
        })
        .await
    }

    pub async fn cardinality_report(
        &self,
        ctx: &RequestContext,
        opts: CallOptions,
    ) -> Result<Vec<CardinalityViolation>, CoreError> {
        ctx.validate()?;
        let workspace_id = ctx.workspace_id.clone();
        self.run(opts, "cardinality_report", move |db| {
            Ok(db.cardinality_violations(&workspace_id)?)
        })
        .await
    }

    // =========================================================================
    // Activity
    // =========================================================================

    pub async fn activity(
        &self,
        ctx: &RequestContext,
        entity_type: &str,
        entity_id: &str,
        opts: CallOptions,
    ) -> Result<ActivityResult, CoreError> {
        let ctx = ctx.clone();
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();
        self.run(opts, "activity", move |db| {
            activity::compute(db, &ctx, &entity_type, &entity_id)
        })
        .await
    }

    /// Number of the current sprint for the caller's workspace, if the
    /// workspace has a sprint start date.
    pub async fn current_period(
        &self,
        ctx: &RequestContext,
        length_days: u32,
        opts: CallOptions,
    ) -> Result<Option<u32>, CoreError> {
        ctx.validate()?;
        if length_days == 0 {
            return Err(CoreError::InvalidArgument("period length must be positive".into()));
        }
        let workspace_id = ctx.workspace_id.clone();
        let today = chrono::Utc::now().date_naive();
        self.run(opts, "current_period", move |db| {
            Ok(db
                .get_workspace_sprint_start(&workspace_id)?
                .and_then(|start| crate::period::period_number(today, start, length_days)))
        })
        .await
    }

    // =========================================================================
    // Audit ledger
    // =========================================================================

    /// Record an action performed by the caller. With `BestEffort`, a failure
    /// yields `Ok(None)`.
    pub async fn record(
        &self,
        ctx: &RequestContext,
        action: AuditAction,
        policy: AuditPolicy,
        opts: CallOptions,
    ) -> Result<Option<DbAuditEvent>, CoreError> {
        ctx.validate()?;
        if action.action.trim().is_empty() {
            return Err(CoreError::InvalidArgument("missing action".to_string()));
        }
        let id = action
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut event = event_for(ctx, id, &action.action);
        event.resource_type = action.resource_type;
        event.resource_id = action.resource_id;
        event.details = action.details;

        let result = self
            .run(opts, "record", move |db| Ok(db.record_audit_event(&event)?))
            .await;
        match (result, policy) {
            (Ok(stored), _) => Ok(Some(stored)),
            (Err(e), AuditPolicy::BestEffort) => {
                log::warn!("Best-effort audit not recorded: {}", e);
                Ok(None)
            }
            (Err(e), AuditPolicy::Required) => Err(e),
        }
    }

    pub async fn query_audit(
        &self,
        ctx: &RequestContext,
        query: AuditQuery,
        opts: CallOptions,
    ) -> Result<Vec<AuditLogEntry>, CoreError> {
        ctx.validate()?;
        let limit = self
            .config
            .effective_limit(query.limit)
            .map_err(CoreError::InvalidArgument)?;
        let filters = query.filters(ctx);
        let offset = query.offset;
        self.run(opts, "query_audit", move |db| {
            Ok(db.query_audit_log(&filters, limit, offset)?)
        })
        .await
    }

    /// CSV of every entry matching the query's filters. Pagination is ignored.
    pub async fn export_audit(
        &self,
        ctx: &RequestContext,
        query: AuditQuery,
        opts: CallOptions,
    ) -> Result<String, CoreError> {
        ctx.validate()?;
        let filters = query.filters(ctx);
        let bytes = self
            .run(opts, "export_audit", move |db| {
                let mut buf = Vec::new();
                audit_export::export_csv(db, &filters, &mut buf)?;
                Ok(buf)
            })
            .await?;
        String::from_utf8(bytes).map_err(|e| CoreError::Internal(e.to_string()))
    }

    /// Recompute the hash chain for the caller's workspace (or, for super
    /// admins, the named one).
    pub async fn verify_audit_chain(
        &self,
        ctx: &RequestContext,
        workspace_id: Option<&str>,
        opts: CallOptions,
    ) -> Result<ChainReport, CoreError> {
        ctx.validate()?;
        let scope = ctx.audit_read_scope(workspace_id);
        self.run(opts, "verify_audit_chain", move |db| {
            Ok(db.verify_audit_chain(scope.as_deref())?)
        })
        .await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Re-run the legacy relationship migration. Steps not started before the
    /// deadline are reported as cancelled.
    pub async fn migrate_relationships(&self, opts: CallOptions) -> Result<MigrationReport, CoreError> {
        let deadline = opts.deadline;
        self.run(CallOptions::default(), "migrate_relationships", move |db| {
            Ok(relationship_migrator::migrate_legacy_relationships(
                db.conn_ref(),
                deadline,
            ))
        })
        .await
    }
}
