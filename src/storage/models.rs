//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::ServiceKind;

/// Terminal status of one workflow execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Error,
    Skipped,
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown log status: {s}")),
        }
    }
}

/// Immutable audit record for one execution attempt.
///
/// Written exactly once per attempt, never mutated. `workflow_id` is
/// `None` only for the "no matching workflow" record, which has no
/// workflow to reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLog {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub workflow_name: Option<String>,
    pub status: LogStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl WorkflowLog {
    pub fn new(
        workflow_id: Option<Uuid>,
        workflow_name: Option<String>,
        status: LogStatus,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            workflow_name,
            status,
            input,
            output: None,
            error_message: None,
            executed_at: Utc::now(),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// A skipped record with a machine-readable reason in the output.
    pub fn skipped(
        workflow_id: Option<Uuid>,
        workflow_name: Option<String>,
        input: Value,
        reason: &str,
    ) -> Self {
        Self::new(workflow_id, workflow_name, LogStatus::Skipped, input)
            .with_output(serde_json::json!({ "reason": reason }))
    }
}

/// One row of the cross-service party mapping table.
///
/// Each side's external id appears in at most one row; a mapping is the
/// sole source of truth for "these two records are the same party."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactMapping {
    pub id: Uuid,
    pub paperless_correspondent_id: String,
    pub lexoffice_contact_id: String,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ContactMapping {
    pub fn new(paperless_correspondent_id: &str, lexoffice_contact_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            paperless_correspondent_id: paperless_correspondent_id.to_string(),
            lexoffice_contact_id: lexoffice_contact_id.to_string(),
            last_synced_at: now,
            created_at: now,
        }
    }
}

/// Stored connector configuration. The engine only reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: Uuid,
    pub connector_type: ServiceKind,
    pub base_url: String,
    /// Credential reference; encryption at rest is handled upstream.
    pub api_token: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An ambiguous name match found during contact reconciliation.
///
/// Recorded whenever a normalized name does not pair exactly one-to-one;
/// the engine never guesses which records belong together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConflict {
    /// The normalized name that failed to pair unambiguously.
    pub name: String,
    /// Unmapped Paperless correspondents carrying the name (id, display name).
    pub paperless_candidates: Vec<(String, String)>,
    /// Unmapped Lexoffice contacts carrying the name (id, display name).
    pub lexoffice_candidates: Vec<(String, String)>,
}

/// Outcome of one reconciliation pass, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub status: LogStatus,
    pub paperless_contacts_seen: u32,
    pub lexoffice_contacts_seen: u32,
    pub mappings_created: u32,
    pub paperless_contacts_created: u32,
    pub lexoffice_contacts_created: u32,
    pub conflicts: Vec<ReconciliationConflict>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
