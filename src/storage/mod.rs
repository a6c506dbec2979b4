//! Persistence layer.
//!
//! Workflow definitions, execution logs, contact mappings and connector
//! configuration live in SQLite. Logs and reconciliation runs are
//! append-only; the engine never mutates them after the fact.

mod models;
mod sqlite;

pub use models::{
    ConnectorConfig, ContactMapping, LogStatus, ReconciliationConflict, ReconciliationRun,
    WorkflowLog,
};
pub use sqlite::SqliteStorage;
