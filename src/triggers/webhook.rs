//! Webhook payload normalization.
//!
//! Each service has its own delivery shape; both reduce to an [`Event`]
//! before entering the pipeline. Signature verification happens upstream
//! of these functions.

use serde_json::{Map, Value};

use crate::workflow::{Event, EventSource};

/// Normalize a Paperless-ngx webhook delivery.
///
/// Paperless posts `{event, document_id, ...}` (some setups use `id` or
/// `event_type`). The raw body is flattened into the event payload with a
/// canonical `document_id` field added, so conditions can reference
/// top-level fields directly.
pub fn paperless_event(raw: Value) -> Event {
    let event_type = raw
        .get("event")
        .or_else(|| raw.get("event_type"))
        .and_then(Value::as_str)
        .unwrap_or("document_created")
        .to_string();
    let document_id = raw.get("document_id").or_else(|| raw.get("id")).cloned();

    let mut payload = as_object(raw);
    if let Some(id) = document_id {
        payload.insert("document_id".to_string(), id);
    }

    Event::new(EventSource::Paperless, event_type, Value::Object(payload))
}

/// Normalize a Lexoffice event subscription delivery.
///
/// Lexoffice posts `{eventType, resourceId, organizationId}`.
pub fn lexoffice_event(raw: Value) -> Event {
    let event_type = raw
        .get("eventType")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let resource_id = raw.get("resourceId").cloned();
    let organization_id = raw.get("organizationId").cloned();

    let mut payload = as_object(raw);
    if let Some(id) = resource_id {
        payload.insert("resource_id".to_string(), id);
    }
    if let Some(org) = organization_id {
        payload.insert("organization_id".to_string(), org);
    }

    Event::new(EventSource::Lexoffice, event_type, Value::Object(payload))
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("body".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paperless_delivery_normalizes_event_type_and_document_id() {
        let event = paperless_event(json!({
            "event": "document_tagged",
            "id": 42,
            "tags": ["Rechnung"]
        }));
        assert_eq!(event.source, EventSource::Paperless);
        assert_eq!(event.event_type, "document_tagged");
        assert_eq!(event.payload["document_id"], 42);
        assert_eq!(event.payload["tags"], json!(["Rechnung"]));
    }

    #[test]
    fn paperless_delivery_defaults_event_type() {
        let event = paperless_event(json!({"document_id": 7}));
        assert_eq!(event.event_type, "document_created");
        assert_eq!(event.payload["document_id"], 7);
    }

    #[test]
    fn lexoffice_delivery_extracts_subscription_fields() {
        let event = lexoffice_event(json!({
            "eventType": "voucher.created",
            "resourceId": "v-1",
            "organizationId": "org-9"
        }));
        assert_eq!(event.source, EventSource::Lexoffice);
        assert_eq!(event.event_type, "voucher.created");
        assert_eq!(event.payload["resource_id"], "v-1");
        assert_eq!(event.payload["organization_id"], "org-9");
    }

    #[test]
    fn non_object_body_is_wrapped_not_dropped() {
        let event = lexoffice_event(json!("ping"));
        assert_eq!(event.event_type, "unknown");
        assert_eq!(event.payload["body"], "ping");
    }
}
