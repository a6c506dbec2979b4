//! Workflow definitions: triggers, the action catalog, and validation.

mod types;
mod validate;

pub use types::{
    Action, ActionKind, AddTagParams, CreateContactParams, CreateDocumentParams,
    CreateVoucherParams, DownloadDocumentParams, Event, EventSource, ParamValue, ServiceKind,
    SyncContactParams, Trigger, UpdateFieldParams, UploadAttachmentParams, Workflow,
    SCHEDULED_RUN,
};
pub use validate::validate_workflow;
