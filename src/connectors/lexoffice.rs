//! Lexoffice (Lexware Office) connector.
//!
//! Vouchers and contacts behind the Lexoffice REST API. Lexoffice
//! enforces a strict 2 requests/second rate limit; callers must inject a
//! limiter configured accordingly. Collections are paginated with
//! `content` / `totalPages` envelopes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{http_client, unsupported, Connector, Contact, ListQuery, ResourceKind, Transport};
use crate::engine::rate_limiter::RateLimiter;
use crate::error::{ConnectorError, ConnectorErrorKind, Error, Result};
use crate::workflow::ServiceKind;

const SERVICE: ServiceKind = ServiceKind::Lexoffice;

/// Page size for contact listings.
const PAGE_SIZE: u32 = 100;

pub struct LexofficeConnector {
    base_url: String,
    api_key: String,
    transport: Transport,
}

impl LexofficeConnector {
    pub fn new(
        base_url: &str,
        api_key: &str,
        limiter: Arc<RateLimiter>,
        retry: super::RetryPolicy,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
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

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn resource_path(&self, kind: ResourceKind) -> Result<&'static str> {
        match kind {
            ResourceKind::Voucher => Ok("/v1/vouchers"),
            ResourceKind::Contact => Ok("/v1/contacts"),
            ResourceKind::Document | ResourceKind::Tag => {
                Err(unsupported(SERVICE, &format!("{kind} access")))
            }
        }
    }

    async fn get_json(&self, operation: &str, url: String, params: Vec<(String, String)>) -> Result<Value> {
        let bearer = self.bearer();
        self.transport
            .execute_json(operation, json!({}), move |client| {
                client
                    .get(&url)
                    .header("Authorization", &bearer)
                    .header("Accept", "application/json")
                    .query(&params)
            })
            .await
    }
}

/// Display name of a Lexoffice contact: the company name, or the person's
/// "first last" for private contacts.
fn contact_display_name(contact: &Value) -> Option<String> {
    if let Some(name) = contact.pointer("/company/name").and_then(Value::as_str) {
        return Some(name.to_string());
    }
    let first = contact.pointer("/person/firstName").and_then(Value::as_str);
    let last = contact.pointer("/person/lastName").and_then(Value::as_str);
    match (first, last) {
        (Some(f), Some(l)) => Some(format!("{f} {l}")),
        (None, Some(l)) => Some(l.to_string()),
        (Some(f), None) => Some(f.to_string()),
        (None, None) => None,
    }
}

#[async_trait]
impl Connector for LexofficeConnector {
    fn service(&self) -> ServiceKind {
        SERVICE
    }

    async fn test_connection(&self) -> Result<Value> {
        self.get_json("test connection", self.url("/v1/profile"), Vec::new())
            .await
    }

    async fn fetch(&self, kind: ResourceKind, id: &str) -> Result<Value> {
        let url = format!("{}/{}", self.url(self.resource_path(kind)?), id);
        self.get_json(&format!("fetch {kind}"), url, Vec::new()).await
    }

    async fn list(&self, kind: ResourceKind, query: &ListQuery) -> Result<Vec<Value>> {
        let path = match kind {
            // Voucher listings go through the voucherlist endpoint.
            ResourceKind::Voucher => "/v1/voucherlist",
            _ => self.resource_path(kind)?,
        };
        let operation = format!("list {kind}");

        let mut results = Vec::new();
        let mut page = 0u32;
        loop {
            let mut params: Vec<(String, String)> = vec![
                ("page".to_string(), page.to_string()),
                ("size".to_string(), PAGE_SIZE.to_string()),
            ];
            if let Some(name) = &query.name {
                params.push(("name".to_string(), name.clone()));
            }
            params.extend(query.params.iter().cloned());

            let body = self.get_json(&operation, self.url(path), params).await?;
            if let Some(items) = body.get("content").and_then(Value::as_array) {
                results.extend(items.iter().cloned());
            }

            let last = body
                .get("last")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| {
                    let total = body.get("totalPages").and_then(Value::as_u64).unwrap_or(1);
                    u64::from(page) + 1 >= total
                });
            if last {
                break;
            }
            page += 1;
        }

        Ok(results)
    }

    async fn create(&self, kind: ResourceKind, payload: Value) -> Result<Value> {
        let url = self.url(self.resource_path(kind)?).to_string();
        let bearer = self.bearer();
        let operation = format!("create {kind}");
        self.transport
            .execute_json(&operation, json!({}), move |client| {
                client
                    .post(&url)
                    .header("Authorization", &bearer)
                    .header("Accept", "application/json")
                    .json(&payload)
            })
            .await
    }

    async fn upload_attachment(
        &self,
        owner_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<Value> {
        let url = format!("{}/{}/files", self.url("/v1/vouchers"), owner_id);
        let bearer = self.bearer();
        let filename = filename.to_string();

        let result = self
            .transport
            .execute_json("upload attachment", json!({"status": "uploaded"}), move |client| {
                let part = reqwest::multipart::Part::bytes(content.clone())
                    .file_name(filename.clone())
                    .mime_str("application/octet-stream")
                    .expect("static mime type");
                let form = reqwest::multipart::Form::new().part("file", part);
                client
                    .post(&url)
                    .header("Authorization", &bearer)
                    .header("Accept", "application/json")
                    .multipart(form)
            })
            .await?;
        info!(voucher_id = owner_id, "uploaded file to voucher");
        Ok(result)
    }

    async fn set_label(&self, _: &str, _: &str) -> Result<Value> {
        // Lexoffice has no tagging concept on vouchers.
        Err(unsupported(SERVICE, "set_label"))
    }

    async fn set_field(&self, owner_id: &str, field: &str, value: Value) -> Result<Value> {
        // Lexoffice updates take the full object; read-modify-write.
        let mut voucher = self.fetch(ResourceKind::Voucher, owner_id).await?;
        match voucher.as_object_mut() {
            Some(map) => {
                map.insert(field.to_string(), value);
            }
            None => {
                return Err(ConnectorError::new(
                    SERVICE,
                    "set field",
                    ConnectorErrorKind::Malformed,
                    "voucher response is not an object",
                )
                .into())
            }
        }

        let url = format!("{}/{}", self.url("/v1/vouchers"), owner_id);
        let bearer = self.bearer();
        self.transport
            .execute_json("set field", json!({}), move |client| {
                client
                    .put(&url)
                    .header("Authorization", &bearer)
                    .header("Accept", "application/json")
                    .json(&voucher)
            })
            .await
    }

    async fn download(&self, _: &str) -> Result<Vec<u8>> {
        Err(unsupported(SERVICE, "download"))
    }

    async fn search_contacts(&self, name: &str) -> Result<Vec<Contact>> {
        // The contacts endpoint filters by name server-side.
        let raw = self
            .list(ResourceKind::Contact, &ListQuery::by_name(name))
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|c| {
                let id = c.get("id")?.as_str()?.to_string();
                let name = contact_display_name(&c)?;
                Some(Contact { id, name })
            })
            .collect())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        let raw = self.list(ResourceKind::Contact, &ListQuery::default()).await?;
        Ok(raw
            .into_iter()
            .filter_map(|c| {
                let id = c.get("id")?.as_str()?.to_string();
                let name = contact_display_name(&c)?;
                Some(Contact { id, name })
            })
            .collect())
    }

    async fn create_contact(&self, name: &str) -> Result<Contact> {
        let created = self
            .create(
                ResourceKind::Contact,
                json!({
                    "version": 0,
                    "roles": { "customer": {} },
                    "company": { "name": name },
                }),
            )
            .await?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::from(ConnectorError::new(
                    SERVICE,
                    "create contact",
                    ConnectorErrorKind::Malformed,
                    "response missing contact id",
                ))
            })?;
        info!(contact_id = %id, name, "created lexoffice contact");
        Ok(Contact {
            id,
            name: name.to_string(),
        })
    }
}
