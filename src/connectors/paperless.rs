//! Paperless-ngx connector.
//!
//! Documents, correspondents and tags behind the Paperless REST API.
//! Paperless paginates with absolute `next` links and wraps collections
//! in a `results` array; list calls follow pagination to completion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::info;

use super::{http_client, unsupported, Connector, Contact, ListQuery, ResourceKind, Transport};
use crate::engine::rate_limiter::RateLimiter;
use crate::error::{ConnectorError, ConnectorErrorKind, Result, Error};
use crate::workflow::ServiceKind;

const SERVICE: ServiceKind = ServiceKind::Paperless;

pub struct PaperlessConnector {
    base_url: String,
    token: String,
    transport: Transport,
}

impl PaperlessConnector {
    pub fn new(
        base_url: &str,
        token: &str,
        limiter: Arc<RateLimiter>,
        retry: super::RetryPolicy,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            transport: Transport {
                service: SERVICE,
                client: http_client(Duration::from_secs(30))?,
                limiter,
                retry,
                acquire_timeout,
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth(&self) -> String {
        format!("Token {}", self.token)
    }

    fn resource_path(&self, kind: ResourceKind) -> Result<&'static str> {
        match kind {
            ResourceKind::Document => Ok("/api/documents/"),
            ResourceKind::Contact => Ok("/api/correspondents/"),
            ResourceKind::Tag => Ok("/api/tags/"),
            ResourceKind::Voucher => Err(unsupported(SERVICE, "voucher access")),
        }
    }

    /// Follow Paperless pagination and collect all `results`.
    async fn paginate(
        &self,
        operation: &str,
        first_url: String,
        params: Vec<(String, String)>,
    ) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        let mut url = first_url;
        let mut params = Some(params);

        loop {
            let request_url = url.clone();
            let request_params = params.take();
            let auth = self.auth();
            let page = self
                .transport
                .execute_json(operation, json!({}), move |client| {
                    let mut req = client.get(&request_url).header("Authorization", &auth);
                    if let Some(p) = &request_params {
                        req = req.query(p);
                    }
                    req
                })
                .await?;

            if let Some(items) = page.get("results").and_then(Value::as_array) {
                results.extend(items.iter().cloned());
            }

            // `next` is an absolute URL with the query embedded.
            match page.get("next").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => url = next.to_string(),
                _ => break,
            }
        }

        Ok(results)
    }
}

#[async_trait]
impl Connector for PaperlessConnector {
    fn service(&self) -> ServiceKind {
        SERVICE
    }

    async fn test_connection(&self) -> Result<Value> {
        let url = self.url("/api/");
        let auth = self.auth();
        self.transport
            .execute_json("test connection", json!({}), move |client| {
                client.get(&url).header("Authorization", &auth)
            })
            .await
    }

    async fn fetch(&self, kind: ResourceKind, id: &str) -> Result<Value> {
        let url = format!("{}{}/", self.url(self.resource_path(kind)?), id);
        let auth = self.auth();
        self.transport
            .execute_json(&format!("fetch {kind}"), json!({}), move |client| {
                client.get(&url).header("Authorization", &auth)
            })
            .await
    }

    async fn list(&self, kind: ResourceKind, query: &ListQuery) -> Result<Vec<Value>> {
        let mut params = query.params.clone();
        if let Some(name) = &query.name {
            params.push(("name__icontains".to_string(), name.clone()));
        }
        self.paginate(
            &format!("list {kind}"),
            self.url(self.resource_path(kind)?),
            params,
        )
        .await
    }

    async fn create(&self, kind: ResourceKind, payload: Value) -> Result<Value> {
        match kind {
            ResourceKind::Document => self.upload_document(payload).await,
            ResourceKind::Contact | ResourceKind::Tag => {
                let url = self.url(self.resource_path(kind)?);
                let auth = self.auth();
                self.transport
                    .execute_json(&format!("create {kind}"), json!({}), move |client| {
                        client
                            .post(&url)
                            .header("Authorization", &auth)
                            .json(&payload)
                    })
                    .await
            }
            ResourceKind::Voucher => Err(unsupported(SERVICE, "create voucher")),
        }
    }

    async fn upload_attachment(&self, _: &str, _: &str, _: Vec<u8>) -> Result<Value> {
        // Paperless documents are standalone; there is no attachment slot.
        Err(unsupported(SERVICE, "upload_attachment"))
    }

    async fn set_label(&self, owner_id: &str, label: &str) -> Result<Value> {
        let tag_id: i64 = label.parse().map_err(|_| {
            Error::from(ConnectorError::new(
                SERVICE,
                "set label",
                ConnectorErrorKind::Malformed,
                format!("label must be a numeric tag id, got '{label}'"),
            ))
        })?;

        // Tags are patched as the full list; read-modify-write.
        let document = self.fetch(ResourceKind::Document, owner_id).await?;
        let mut tags: Vec<i64> = document
            .get("tags")
            .and_then(Value::as_array)
            .map(|t| t.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        if !tags.contains(&tag_id) {
            tags.push(tag_id);
        }

        let result = self
            .set_field(owner_id, "tags", json!(tags))
            .await?;
        info!(document_id = owner_id, tag_id, "added tag to document");
        Ok(result)
    }

    async fn set_field(&self, owner_id: &str, field: &str, value: Value) -> Result<Value> {
        let url = format!("{}{}/", self.url("/api/documents/"), owner_id);
        let auth = self.auth();
        let body = json!({ field: value });
        self.transport
            .execute_json("set field", json!({}), move |client| {
                client
                    .patch(&url)
                    .header("Authorization", &auth)
                    .json(&body)
            })
            .await
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}/download/", self.url("/api/documents/"), id);
        let auth = self.auth();
        let resp = self
            .transport
            .execute("download document", move |client| {
                client.get(&url).header("Authorization", &auth)
            })
            .await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ConnectorError::from_transport(SERVICE, "download document", &e))?;
        Ok(bytes.to_vec())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        let raw = self.list(ResourceKind::Contact, &ListQuery::default()).await?;
        Ok(raw
            .into_iter()
            .filter_map(|c| {
                let id = scalar_string(c.get("id")?);
                let name = c.get("name")?.as_str()?.to_string();
                Some(Contact { id, name })
            })
            .collect())
    }

    async fn create_contact(&self, name: &str) -> Result<Contact> {
        let created = self
            .create(
                ResourceKind::Contact,
                json!({ "name": name, "match": "", "matching_algorithm": 0 }),
            )
            .await?;
        let id = created
            .get("id")
            .map(scalar_string)
            .ok_or_else(|| {
                Error::from(ConnectorError::new(
                    SERVICE,
                    "create contact",
                    ConnectorErrorKind::Malformed,
                    "response missing correspondent id",
                ))
            })?;
        info!(correspondent_id = %id, name, "created paperless correspondent");
        Ok(Contact {
            id,
            name: name.to_string(),
        })
    }
}

impl PaperlessConnector {
    /// Upload a document via the multipart consume endpoint.
    ///
    /// Payload fields: `content` (base64), `filename`, and optionally
    /// `title`, `correspondent_id`, `document_type_id`, `tag_ids`.
    async fn upload_document(&self, payload: Value) -> Result<Value> {
        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64))
            .transpose()
            .map_err(|e| {
                Error::from(ConnectorError::new(
                    SERVICE,
                    "create document",
                    ConnectorErrorKind::Malformed,
                    format!("content is not valid base64: {e}"),
                ))
            })?
            .unwrap_or_default();
        let filename = payload
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("document.pdf")
            .to_string();

        let url = self.url("/api/documents/post_document/");
        let auth = self.auth();
        let meta = payload.clone();

        self.transport
            .execute_json("create document", json!({"status": "accepted"}), move |client| {
                let part = reqwest::multipart::Part::bytes(content.clone())
                    .file_name(filename.clone())
                    .mime_str("application/octet-stream")
                    .expect("static mime type");
                let mut form = reqwest::multipart::Form::new().part("document", part);
                if let Some(title) = meta.get("title").and_then(Value::as_str) {
                    form = form.text("title", title.to_string());
                }
                if let Some(c) = meta.get("correspondent_id") {
                    form = form.text("correspondent", scalar_string(c));
                }
                if let Some(d) = meta.get("document_type_id") {
                    form = form.text("document_type", scalar_string(d));
                }
                if let Some(tags) = meta.get("tag_ids").and_then(Value::as_array) {
                    for tag in tags {
                        form = form.text("tags", scalar_string(tag));
                    }
                }
                client
                    .post(&url)
                    .header("Authorization", &auth)
                    .multipart(form)
            })
            .await
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
