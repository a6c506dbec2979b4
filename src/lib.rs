//! lexbridge - workflow automation between Paperless-ngx and Lexoffice.
//!
//! An event arrives (a webhook from either service or an internal
//! schedule tick), is matched against stored trigger definitions, its
//! conditions are evaluated against the payload, and, if satisfied, an
//! ordered sequence of actions runs against one of the two services
//! through rate-limited, retrying connectors. A periodic reconciliation
//! pass keeps Paperless correspondents and Lexoffice contacts aligned
//! through a mapping table.
//!
//! ## Example
//!
//! A workflow definition that books every document tagged "Rechnung" as a
//! purchase invoice and attaches the PDF:
//!
//! ```json
//! {
//!   "name": "book-invoices",
//!   "triggers": [{
//!     "source": "paperless",
//!     "event_type": "document_tagged",
//!     "conditions": { "field": "tags", "operator": "contains", "value": "Rechnung" }
//!   }],
//!   "actions": [
//!     { "target": "paperless", "sort_order": 1,
//!       "action_type": "download_document", "parameters": {} },
//!     { "target": "lexoffice", "sort_order": 2,
//!       "action_type": "create_voucher",
//!       "parameters": { "voucher_number": "{{ event.document_id }}" } },
//!     { "target": "lexoffice", "sort_order": 3,
//!       "action_type": "upload_attachment",
//!       "parameters": { "voucher_id": "{{ voucher.id }}" } }
//!   ]
//! }
//! ```

pub mod api;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod error;
pub mod storage;
pub mod sync;
pub mod triggers;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};
