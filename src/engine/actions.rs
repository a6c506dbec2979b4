//! Action implementations.
//!
//! Each catalog entry maps to one or two capability calls on the target
//! connector. Parameters arrive already resolved (templates substituted);
//! a parameter that is still missing falls back to the run context, the
//! same precedence the rest of the pipeline uses for chained values.
//! Missing *required* runtime data yields a soft `{"...": false, "reason"}`
//! result rather than a failure; only connector errors abort the run.

use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::connectors::{Connector, ResourceKind};
use crate::engine::context::RunContext;
use crate::error::Result;
use crate::storage::{ContactMapping, SqliteStorage};
use crate::workflow::{ActionKind, ParamValue};

/// Execute one resolved action against its connector and return the
/// output that joins the run context.
pub async fn run_action(
    kind: &ActionKind,
    connector: &Arc<dyn Connector>,
    ctx: &RunContext,
    storage: &SqliteStorage,
) -> Result<Value> {
    match kind {
        ActionKind::CreateVoucher(p) => {
            let mut voucher = json!({
                "type": p.voucher_type,
                "voucherNumber": string_param(&p.voucher_number, ctx, "voucher_number")
                    .unwrap_or_default(),
                "voucherDate": string_param(&p.voucher_date, ctx, "voucher_date")
                    .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string()),
                "totalGrossAmount": value_param(&p.total_gross_amount, ctx, "total_gross_amount")
                    .unwrap_or(json!(0)),
                "taxType": p.tax_type,
                "voucherItems": value_param(&p.voucher_items, ctx, "voucher_items")
                    .unwrap_or(json!([])),
            });
            if let Some(contact_id) = string_param(&p.contact_id, ctx, "lexoffice_contact_id") {
                voucher["contactId"] = json!(contact_id);
            }

            let result = connector.create(ResourceKind::Voucher, voucher).await?;
            info!(voucher_id = ?result.get("id"), "created voucher");
            Ok(json!({ "voucher": result }))
        }

        ActionKind::CreateDocument(p) => {
            let mut payload = json!({
                "filename": string_param(&p.filename, ctx, "filename")
                    .unwrap_or_else(|| "document.pdf".to_string()),
            });
            if let Some(content) = string_param(&p.content, ctx, "file_content") {
                payload["content"] = json!(content);
            }
            if let Some(title) = string_param(&p.title, ctx, "title") {
                payload["title"] = json!(title);
            }
            if let Some(c) = value_param(&p.correspondent_id, ctx, "correspondent_id") {
                payload["correspondent_id"] = c;
            }
            if let Some(d) = value_param(&p.document_type_id, ctx, "document_type_id") {
                payload["document_type_id"] = d;
            }
            if let Some(tags) = value_param(&p.tag_ids, ctx, "tag_ids") {
                payload["tag_ids"] = tags;
            }

            let result = connector.create(ResourceKind::Document, payload).await?;
            Ok(json!({ "upload": result }))
        }

        ActionKind::UploadAttachment(p) => {
            let voucher_id = string_param(&p.voucher_id, ctx, "voucher_id")
                .or_else(|| nested_string(ctx, "voucher", "id"));
            let Some(voucher_id) = voucher_id else {
                return Ok(soft_failure("uploaded", "no voucher_id available"));
            };
            let Some(encoded) = string_param(&p.content, ctx, "file_content") else {
                return Ok(soft_failure("uploaded", "no file content available"));
            };
            let content = match base64::engine::general_purpose::STANDARD.decode(&encoded) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Ok(soft_failure(
                        "uploaded",
                        &format!("file content is not valid base64: {e}"),
                    ))
                }
            };
            let filename = string_param(&p.filename, ctx, "filename")
                .unwrap_or_else(|| "document.pdf".to_string());

            let result = connector
                .upload_attachment(&voucher_id, &filename, content)
                .await?;
            Ok(json!({ "uploaded": true, "attachment": result }))
        }

        ActionKind::AddTag(p) => {
            let document_id = string_param(&p.document_id, ctx, "document_id");
            let tag_id = string_param(&p.tag_id, ctx, "tag_id");
            let (Some(document_id), Some(tag_id)) = (document_id, tag_id) else {
                return Ok(soft_failure("tagged", "missing document_id or tag_id"));
            };

            let result = connector.set_label(&document_id, &tag_id).await?;
            Ok(json!({ "tagged": true, "document": result }))
        }

        ActionKind::UpdateField(p) => {
            let item_id = string_param(&p.item_id, ctx, "item_id")
                .or_else(|| string_param(&None, ctx, "document_id"));
            let Some(item_id) = item_id else {
                return Ok(soft_failure("updated", "missing item_id"));
            };
            let value = value_param(&p.value, ctx, &p.field).unwrap_or(Value::Null);

            let result = connector.set_field(&item_id, &p.field, value).await?;
            Ok(json!({ "updated": true, "item": result }))
        }

        ActionKind::CreateContact(p) => {
            let Some(name) = string_param(&p.name, ctx, "correspondent_name") else {
                return Ok(soft_failure("created", "no contact name provided"));
            };
            let contact = connector.create_contact(&name).await?;
            Ok(json!({ "created": true, "contact": contact }))
        }

        ActionKind::DownloadDocument(p) => {
            let Some(document_id) = string_param(&p.document_id, ctx, "document_id") else {
                return Ok(soft_failure("downloaded", "missing document_id"));
            };

            let content = connector.download(&document_id).await?;
            let meta = connector.fetch(ResourceKind::Document, &document_id).await?;
            let filename = meta
                .get("original_file_name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("document_{document_id}.pdf"));

            info!(%document_id, size = content.len(), "downloaded document");
            Ok(json!({
                "downloaded": true,
                "filename": filename,
                "size": content.len(),
                "file_content": base64::engine::general_purpose::STANDARD.encode(content),
            }))
        }

        ActionKind::SyncContact(p) => {
            let Some(name) = string_param(&p.correspondent_name, ctx, "correspondent_name")
            else {
                return Ok(soft_failure("synced", "no correspondent name provided"));
            };

            let matches = connector.search_contacts(&name).await?;
            let (contact, created) = match matches.into_iter().next() {
                Some(existing) => {
                    info!(contact_id = %existing.id, "found existing lexoffice contact");
                    (existing, false)
                }
                None => {
                    let new_contact = connector.create_contact(&name).await?;
                    (new_contact, true)
                }
            };

            // When the event carries the Paperless correspondent id, the
            // pairing is known and can be recorded right away. Sides that
            // are already mapped keep their existing row.
            if let Some(correspondent_id) = string_param(&None, ctx, "correspondent_id") {
                let mapping = ContactMapping::new(&correspondent_id, &contact.id);
                if storage.insert_mapping(&mapping).await.is_ok() {
                    info!(
                        %correspondent_id,
                        lexoffice_contact_id = %contact.id,
                        "recorded contact mapping"
                    );
                }
            }

            Ok(json!({
                "synced": true,
                "lexoffice_contact_id": contact.id,
                "created": created,
            }))
        }
    }
}

fn soft_failure(flag: &str, reason: &str) -> Value {
    json!({ flag: false, "reason": reason })
}

/// A parameter value, falling back to the run context under `key`.
/// `null` counts as missing: unresolved template references resolve to
/// `null` and must not mask the context fallback.
fn value_param(param: &Option<ParamValue>, ctx: &RunContext, key: &str) -> Option<Value> {
    match param {
        Some(v) if !v.is_null() => Some(v.clone()),
        _ => ctx.get(key).filter(|v| !v.is_null()).cloned(),
    }
}

/// Like [`value_param`], stringifying scalars (ids arrive as either JSON
/// numbers or strings depending on the service).
fn string_param(param: &Option<ParamValue>, ctx: &RunContext, key: &str) -> Option<String> {
    value_param(param, ctx, key).and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn nested_string(ctx: &RunContext, key: &str, field: &str) -> Option<String> {
    ctx.get(key)?.get(field).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
