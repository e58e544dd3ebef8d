//! Tenant scoping for every call into the core.
//!
//! The route/auth layer authenticates the caller and hands us a
//! `RequestContext`. Every association, activity, and audit operation in the
//! service facade takes one, and every document lookup it performs is filtered
//! by `workspace_id` so a foreign id behaves exactly like a missing one.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Authenticated caller identity, bound to exactly one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub workspace_id: String,
    /// The real actor. When impersonating, this is the admin doing the impersonation.
    pub actor_user_id: String,
    /// The user being impersonated, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonating_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Platform operators may read the audit ledger across workspaces.
    #[serde(default)]
    pub is_super_admin: bool,
}

impl RequestContext {
    pub fn new(workspace_id: impl Into<String>, actor_user_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            actor_user_id: actor_user_id.into(),
            impersonating_user_id: None,
            ip_address: None,
            user_agent: None,
            is_super_admin: false,
        }
    }

    pub fn impersonating(mut self, user_id: impl Into<String>) -> Self {
        self.impersonating_user_id = Some(user_id.into());
        self
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Reject a context that cannot be bound to a tenant.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.workspace_id.trim().is_empty() {
            return Err(CoreError::InvalidArgument("missing workspace".to_string()));
        }
        if self.actor_user_id.trim().is_empty() {
            return Err(CoreError::InvalidArgument("missing actor".to_string()));
        }
        Ok(())
    }

    /// Resolve which workspace an audit read may cover.
    ///
    /// Ordinary callers are always pinned to their own workspace, whatever they
    /// ask for. Super admins may name any workspace or none (all).
    pub fn audit_read_scope(&self, requested: Option<&str>) -> Option<String> {
        if self.is_super_admin {
            requested.map(str::to_string)
        } else {
            Some(self.workspace_id.clone())
        }
    }
}

/// Reject ids that cannot possibly name a document before touching storage.
pub fn validate_id(kind: &str, id: &str) -> Result<(), CoreError> {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed.len() > 128 || trimmed.len() != id.len() {
        return Err(CoreError::InvalidArgument(format!("malformed {} id", kind)));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(CoreError::InvalidArgument(format!("malformed {} id", kind)));
    }
    Ok(())
}
