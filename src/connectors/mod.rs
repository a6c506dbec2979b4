//! External service connectors.
//!
//! Both services are driven through one capability-set trait; the engine
//! (executor, reconciliation) never names a concrete connector type. Every
//! outbound call acquires a rate-limiter token first and then runs under
//! the bounded retry policy in [`retry`].

mod lexoffice;
mod paperless;
pub mod retry;

pub use lexoffice::LexofficeConnector;
pub use paperless::PaperlessConnector;
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::rate_limiter::RateLimiter;
use crate::error::{ConnectorError, Error, Result};
use crate::workflow::ServiceKind;

/// Resource kinds addressable through the capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Document,
    Voucher,
    /// Contacts in Lexoffice, correspondents in Paperless.
    Contact,
    Tag,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::Voucher => write!(f, "voucher"),
            Self::Contact => write!(f, "contact"),
            Self::Tag => write!(f, "tag"),
        }
    }
}

/// Filters for list calls.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Service-side name filter, where supported.
    pub name: Option<String>,
    /// Additional raw query parameters.
    pub params: Vec<(String, String)>,
}

impl ListQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// A party record normalized across both services: Lexoffice contacts and
/// Paperless correspondents both reduce to an external id and a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
}

/// The uniform capability set, implemented once per external service.
#[async_trait]
pub trait Connector: Send + Sync {
    fn service(&self) -> ServiceKind;

    /// Probe reachability and credentials.
    async fn test_connection(&self) -> Result<Value>;

    /// Fetch a single item by id.
    async fn fetch(&self, kind: ResourceKind, id: &str) -> Result<Value>;

    /// List items, following service pagination to completion.
    async fn list(&self, kind: ResourceKind, query: &ListQuery) -> Result<Vec<Value>>;

    /// Create an item and return the service's representation of it.
    async fn create(&self, kind: ResourceKind, payload: Value) -> Result<Value>;

    /// Attach a file to an existing item.
    async fn upload_attachment(
        &self,
        owner_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<Value>;

    /// Add a label (Paperless tag) to an item.
    async fn set_label(&self, owner_id: &str, label: &str) -> Result<Value>;

    /// Patch a single field on an item.
    async fn set_field(&self, owner_id: &str, field: &str, value: Value) -> Result<Value>;

    /// Fetch an item's file content.
    async fn download(&self, id: &str) -> Result<Vec<u8>>;

    /// Full contact set, normalized to `{id, name}` records.
    async fn list_contacts(&self) -> Result<Vec<Contact>>;

    /// Contacts whose name contains the given needle (case-insensitive).
    /// Connectors override this where the service filters server-side.
    async fn search_contacts(&self, name: &str) -> Result<Vec<Contact>> {
        let needle = name.to_lowercase();
        Ok(self
            .list_contacts()
            .await?
            .into_iter()
            .filter(|c| c.name.to_lowercase().contains(&needle))
            .collect())
    }

    /// Create a contact with the given display name.
    async fn create_contact(&self, name: &str) -> Result<Contact>;
}

/// The two live connectors, addressed by service.
#[derive(Clone)]
pub struct Connectors {
    pub paperless: Arc<dyn Connector>,
    pub lexoffice: Arc<dyn Connector>,
}

impl Connectors {
    pub fn for_service(&self, service: ServiceKind) -> &Arc<dyn Connector> {
        match service {
            ServiceKind::Paperless => &self.paperless,
            ServiceKind::Lexoffice => &self.lexoffice,
        }
    }
}

/// A capability the service's API simply does not offer.
pub(crate) fn unsupported(service: ServiceKind, operation: &str) -> Error {
    ConnectorError::new(
        service,
        operation,
        crate::error::ConnectorErrorKind::Malformed,
        format!("{operation} is not supported by {service}"),
    )
    .into()
}

/// Shared HTTP transport: rate-limiter gate plus bounded retry around a
/// rebuildable request.
pub(crate) struct Transport {
    pub service: ServiceKind,
    pub client: reqwest::Client,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
    /// Wait budget for rate-limiter token acquisition per attempt.
    pub acquire_timeout: Duration,
}

impl Transport {
    /// Run one logical call: acquire a token, send, classify, retry
    /// transient failures with backoff.
    ///
    /// `build` is invoked once per attempt; request bodies must therefore
    /// be reconstructable from captured data.
    pub async fn execute<F>(&self, operation: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 1u32;

        loop {
            self.limiter.acquire(self.acquire_timeout).await?;

            let err = match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    let excerpt: String = body.chars().take(512).collect();
                    ConnectorError::from_response(
                        self.service,
                        operation,
                        status.as_u16(),
                        excerpt,
                    )
                }
                Err(e) => ConnectorError::from_transport(self.service, operation, &e),
            };
            if !err.kind.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(err.into());
            }

            let delay = self.retry.delay(attempt);
            warn!(
                service = %self.service,
                operation,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying connector call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Execute and decode a JSON body; empty bodies decode to the fallback.
    pub async fn execute_json<F>(
        &self,
        operation: &str,
        fallback: Value,
        build: F,
    ) -> Result<Value>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let resp = self.execute(operation, build).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ConnectorError::from_transport(self.service, operation, &e))?;
        if bytes.is_empty() {
            debug!(service = %self.service, operation, "empty response body");
            return Ok(fallback);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            ConnectorError::new(
                self.service,
                operation,
                crate::error::ConnectorErrorKind::Malformed,
                format!("invalid JSON response: {e}"),
            )
            .into()
        })
    }
}

/// Build the reqwest client both connectors use.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}
