//! Workflow definition types.
//!
//! A workflow couples an ordered set of triggers (when to run) with an
//! ordered set of actions (what to do against Paperless or Lexoffice).
//! Definitions are stored as JSON documents and parsed into these types,
//! which reject unknown action types and operators at parse time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::conditions::Condition;

/// The two external services the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Paperless,
    Lexoffice,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paperless => write!(f, "paperless"),
            Self::Lexoffice => write!(f, "lexoffice"),
        }
    }
}

/// Where an event originated: one of the services, or the internal clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Paperless,
    Lexoffice,
    Schedule,
}

impl EventSource {
    /// The service this source corresponds to, if any.
    pub fn service(self) -> Option<ServiceKind> {
        match self {
            Self::Paperless => Some(ServiceKind::Paperless),
            Self::Lexoffice => Some(ServiceKind::Lexoffice),
            Self::Schedule => None,
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paperless => write!(f, "paperless"),
            Self::Lexoffice => write!(f, "lexoffice"),
            Self::Schedule => write!(f, "schedule"),
        }
    }
}

/// An incoming event: a webhook delivery or a schedule tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub source: EventSource,
    pub event_type: String,
    /// Flat-ish JSON payload; condition fields and parameter references
    /// resolve against this.
    pub payload: Value,
}

impl Event {
    pub fn new(source: EventSource, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            source,
            event_type: event_type.into(),
            payload,
        }
    }

    /// The event a schedule trigger injects into the pipeline.
    pub fn schedule_tick(workflow_id: Uuid, event_type: &str, fired_at: DateTime<Utc>) -> Self {
        Self {
            source: EventSource::Schedule,
            event_type: event_type.to_string(),
            payload: serde_json::json!({
                "workflow_id": workflow_id,
                "fired_at": fired_at.to_rfc3339(),
            }),
        }
    }
}

/// Default event type for schedule triggers.
pub const SCHEDULED_RUN: &str = "scheduled_run";

/// A workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Workflow {
    /// Triggers in evaluation order.
    pub fn triggers_ordered(&self) -> Vec<&Trigger> {
        let mut triggers: Vec<&Trigger> = self.triggers.iter().collect();
        triggers.sort_by_key(|t| t.sort_order);
        triggers
    }

    /// Actions in execution order.
    pub fn actions_ordered(&self) -> Vec<&Action> {
        let mut actions: Vec<&Action> = self.actions.iter().collect();
        actions.sort_by_key(|a| a.sort_order);
        actions
    }
}

/// A trigger bound to an event source and type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub source: EventSource,
    pub event_type: String,
    #[serde(default)]
    pub conditions: Option<Condition>,
    /// Cron cadence; only meaningful when `source == schedule`.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

impl Trigger {
    /// Whether this trigger is a candidate for the event (source and
    /// event type match). Conditions are evaluated separately.
    pub fn matches(&self, event: &Event) -> bool {
        self.source == event.source && self.event_type == event.event_type
    }
}

/// A parameter value: either a JSON literal or a `{{ path }}` reference
/// into the run context (event payload and prior action outputs).
pub type ParamValue = Value;

/// One parameterized operation against an external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub target: ServiceKind,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// The closed action catalog.
///
/// Unknown `action_type` values fail deserialization, so malformed
/// definitions are rejected before they are ever runnable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "parameters", rename_all = "snake_case")]
pub enum ActionKind {
    /// Create an accounting voucher in Lexoffice.
    CreateVoucher(CreateVoucherParams),
    /// Upload a document into Paperless.
    CreateDocument(CreateDocumentParams),
    /// Attach a file to an existing Lexoffice voucher.
    UploadAttachment(UploadAttachmentParams),
    /// Add a tag to a Paperless document.
    AddTag(AddTagParams),
    /// Patch a single field on an item in either service.
    UpdateField(UpdateFieldParams),
    /// Create a contact (Lexoffice) or correspondent (Paperless).
    CreateContact(CreateContactParams),
    /// Fetch document bytes from Paperless into the run context.
    DownloadDocument(DownloadDocumentParams),
    /// Find or create a Lexoffice contact by name and record the mapping.
    SyncContact(SyncContactParams),
}

impl ActionKind {
    /// The wire name of the action type, as used in definitions and logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CreateVoucher(_) => "create_voucher",
            Self::CreateDocument(_) => "create_document",
            Self::UploadAttachment(_) => "upload_attachment",
            Self::AddTag(_) => "add_tag",
            Self::UpdateField(_) => "update_field",
            Self::CreateContact(_) => "create_contact",
            Self::DownloadDocument(_) => "download_document",
            Self::SyncContact(_) => "sync_contact",
        }
    }

    /// The service this action kind is allowed to target, if fixed.
    pub fn required_target(&self) -> Option<ServiceKind> {
        match self {
            Self::CreateVoucher(_) | Self::UploadAttachment(_) | Self::SyncContact(_) => {
                Some(ServiceKind::Lexoffice)
            }
            Self::CreateDocument(_) | Self::AddTag(_) | Self::DownloadDocument(_) => {
                Some(ServiceKind::Paperless)
            }
            Self::UpdateField(_) | Self::CreateContact(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVoucherParams {
    #[serde(default = "default_voucher_type")]
    pub voucher_type: String,
    #[serde(default)]
    pub voucher_number: Option<ParamValue>,
    #[serde(default)]
    pub voucher_date: Option<ParamValue>,
    #[serde(default)]
    pub total_gross_amount: Option<ParamValue>,
    #[serde(default = "default_tax_type")]
    pub tax_type: String,
    #[serde(default)]
    pub voucher_items: Option<ParamValue>,
    #[serde(default)]
    pub contact_id: Option<ParamValue>,
}

fn default_voucher_type() -> String {
    "purchaseinvoice".to_string()
}

fn default_tax_type() -> String {
    "gross".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDocumentParams {
    #[serde(default)]
    pub filename: Option<ParamValue>,
    #[serde(default)]
    pub title: Option<ParamValue>,
    #[serde(default)]
    pub correspondent_id: Option<ParamValue>,
    #[serde(default)]
    pub document_type_id: Option<ParamValue>,
    #[serde(default)]
    pub tag_ids: Option<ParamValue>,
    /// Base64 file bytes; defaults to `file_content` from the run context
    /// (as left there by a prior `download_document`).
    #[serde(default)]
    pub content: Option<ParamValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAttachmentParams {
    #[serde(default)]
    pub voucher_id: Option<ParamValue>,
    #[serde(default)]
    pub filename: Option<ParamValue>,
    /// Base64 file bytes; defaults to `file_content` from the run context.
    #[serde(default)]
    pub content: Option<ParamValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTagParams {
    #[serde(default)]
    pub document_id: Option<ParamValue>,
    #[serde(default)]
    pub tag_id: Option<ParamValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFieldParams {
    #[serde(default)]
    pub item_id: Option<ParamValue>,
    pub field: String,
    #[serde(default)]
    pub value: Option<ParamValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContactParams {
    #[serde(default)]
    pub name: Option<ParamValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadDocumentParams {
    #[serde(default)]
    pub document_id: Option<ParamValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncContactParams {
    #[serde(default)]
    pub correspondent_name: Option<ParamValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_catalog_rejects_unknown_type() {
        let raw = serde_json::json!({
            "target": "lexoffice",
            "sort_order": 1,
            "action_type": "launch_missiles",
            "parameters": {}
        });
        assert!(serde_json::from_value::<Action>(raw).is_err());
    }

    #[test]
    fn action_parses_known_type_with_parameters() {
        let raw = serde_json::json!({
            "target": "lexoffice",
            "sort_order": 1,
            "action_type": "create_voucher",
            "parameters": {
                "voucher_number": "{{ event.document_id }}",
                "total_gross_amount": 119.0
            }
        });
        let action: Action = serde_json::from_value(raw).unwrap();
        match &action.kind {
            ActionKind::CreateVoucher(p) => {
                assert_eq!(p.voucher_type, "purchaseinvoice");
                assert_eq!(p.tax_type, "gross");
                assert!(p.voucher_number.is_some());
            }
            other => panic!("unexpected kind: {}", other.type_name()),
        }
    }

    #[test]
    fn schedule_tick_payload_names_workflow() {
        let id = Uuid::new_v4();
        let event = Event::schedule_tick(id, SCHEDULED_RUN, Utc::now());
        assert_eq!(event.source, EventSource::Schedule);
        assert_eq!(event.payload["workflow_id"], serde_json::json!(id));
    }
}
