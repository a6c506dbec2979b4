//! Scripted connector for engine and reconciliation tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::connectors::{Connector, Contact, ListQuery, ResourceKind};
use crate::error::{ConnectorError, ConnectorErrorKind, Result};
use crate::workflow::ServiceKind;

/// A connector whose behavior is scripted per test: seeded contacts,
/// per-operation failures, optional per-call delay, and a full call trace.
pub struct MockConnector {
    service: ServiceKind,
    contacts: Mutex<Vec<Contact>>,
    fail_on: Mutex<HashMap<String, ConnectorError>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
    counter: AtomicU32,
}

impl MockConnector {
    pub fn new(service: ServiceKind) -> Self {
        Self {
            service,
            contacts: Mutex::new(Vec::new()),
            fail_on: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
            counter: AtomicU32::new(0),
        }
    }

    pub fn with_contacts(self, contacts: Vec<Contact>) -> Self {
        *self.contacts.lock().unwrap() = contacts;
        self
    }

    /// Every call stalls for `delay` before completing; lets tests hold an
    /// execution in-flight while a second event arrives.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Script the next calls of `operation` to fail with `error`.
    pub fn fail_operation(&self, operation: &str, error: ConnectorError) {
        self.fail_on
            .lock()
            .unwrap()
            .insert(operation.to_string(), error);
    }

    /// Operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.lock().unwrap().clone()
    }

    async fn record(&self, operation: &str) -> Result<()> {
        self.calls.lock().unwrap().push(operation.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.fail_on.lock().unwrap().get(operation).cloned();
        match scripted {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n}")
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn service(&self) -> ServiceKind {
        self.service
    }

    async fn test_connection(&self) -> Result<Value> {
        self.record("test connection").await?;
        Ok(json!({"success": true}))
    }

    async fn fetch(&self, kind: ResourceKind, id: &str) -> Result<Value> {
        self.record(&format!("fetch {kind}")).await?;
        Ok(json!({"id": id, "original_file_name": format!("{id}.pdf")}))
    }

    async fn list(&self, kind: ResourceKind, _query: &ListQuery) -> Result<Vec<Value>> {
        self.record(&format!("list {kind}")).await?;
        Ok(Vec::new())
    }

    async fn create(&self, kind: ResourceKind, payload: Value) -> Result<Value> {
        self.record(&format!("create {kind}")).await?;
        let mut result = json!({"id": self.next_id(&format!("{}-{kind}", self.service))});
        if let (Some(out), Some(body)) = (result.as_object_mut(), payload.as_object()) {
            for (k, v) in body {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        Ok(result)
    }

    async fn upload_attachment(&self, owner_id: &str, filename: &str, _: Vec<u8>) -> Result<Value> {
        self.record("upload attachment").await?;
        Ok(json!({"status": "uploaded", "owner": owner_id, "filename": filename}))
    }

    async fn set_label(&self, owner_id: &str, label: &str) -> Result<Value> {
        self.record("set label").await?;
        Ok(json!({"id": owner_id, "tags": [label]}))
    }

    async fn set_field(&self, owner_id: &str, field: &str, value: Value) -> Result<Value> {
        self.record("set field").await?;
        Ok(json!({"id": owner_id, field: value}))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        self.record("download").await?;
        Ok(format!("content of {id}").into_bytes())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.record("list contacts").await?;
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn create_contact(&self, name: &str) -> Result<Contact> {
        self.record("create contact").await?;
        let contact = Contact {
            id: self.next_id(&format!("{}-contact", self.service)),
            name: name.to_string(),
        };
        self.contacts.lock().unwrap().push(contact.clone());
        Ok(contact)
    }
}

/// Shorthand for a scripted malformed-request failure.
pub fn malformed(service: ServiceKind, operation: &str, status: u16) -> ConnectorError {
    ConnectorError::from_response(service, operation, status, "scripted failure")
}

/// Shorthand for a scripted transient failure.
pub fn transient(service: ServiceKind, operation: &str) -> ConnectorError {
    ConnectorError::new(
        service,
        operation,
        ConnectorErrorKind::Transient,
        "scripted transient failure",
    )
}
