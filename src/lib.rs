//! docgraph: workspace-scoped document association graph and append-only
//! audit ledger.
//!
//! `db` holds the blocking SQLite layer; `service::CoreService` is the async
//! facade the route layer talks to.

pub mod activity;
pub mod audit_export;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
mod migrations;
pub mod period;
pub mod relationship_migrator;
pub mod retry;
pub mod service;
pub mod util;
pub mod workspace;

pub use error::{ApiError, CoreError};
pub use service::{AuditPolicy, CallOptions, CoreService};
pub use workspace::RequestContext;
