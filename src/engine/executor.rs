//! Workflow executor.
//!
//! Runs a workflow's ordered action list against the connectors, under the
//! per-workflow execution lock and an overall deadline. Failure policy is
//! fail-fast: the first connector failure aborts the remaining sequence.
//! Completed actions are never rolled back; connectors are idempotent on
//! natural keys and operators re-run workflows manually after fixing the
//! cause. Every attempt produces exactly one immutable log record.

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use crate::connectors::Connectors;
use crate::engine::actions::run_action;
use crate::engine::context::RunContext;
use crate::engine::locks::LockArena;
use crate::error::{Error, Result};
use crate::storage::{LogStatus, SqliteStorage, WorkflowLog};
use crate::workflow::{ActionKind, Event, Workflow};

/// Default overall deadline for one execution attempt.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Reason recorded when the execution lock is contended.
pub const REASON_ALREADY_RUNNING: &str = "previous execution still running";

/// Workflow executor.
pub struct Executor {
    connectors: Connectors,
    storage: SqliteStorage,
    locks: LockArena,
    timeout: Duration,
}

impl Executor {
    pub fn new(connectors: Connectors, storage: SqliteStorage) -> Self {
        Self {
            connectors,
            storage,
            locks: LockArena::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Override the overall execution deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute a workflow for a triggering event.
    ///
    /// Always persists and returns exactly one log record; connector
    /// failures are captured in the record rather than propagated.
    #[instrument(
        name = "workflow.execute",
        skip(self, workflow, event),
        fields(
            workflow_id = %workflow.id,
            workflow_name = %workflow.name,
            source = %event.source,
            event_type = %event.event_type,
        )
    )]
    pub async fn execute(&self, workflow: &Workflow, event: &Event) -> Result<WorkflowLog> {
        let input = serde_json::to_value(event)?;

        // Webhooks and schedule ticks may race on the same workflow; a
        // contended attempt resolves to skipped, never queued. The guard
        // covers the whole run.
        let Some(_guard) = self.locks.try_acquire(workflow.id) else {
            warn!("execution lock contended, skipping");
            let log = WorkflowLog::skipped(
                Some(workflow.id),
                Some(workflow.name.clone()),
                input,
                REASON_ALREADY_RUNNING,
            );
            self.storage.save_log(&log).await?;
            return Ok(log);
        };

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut ctx = RunContext::new(&event.payload);
        let mut trace: Vec<Value> = Vec::new();
        let mut failure: Option<String> = None;

        info!("starting execution");

        for action in workflow.actions_ordered() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                failure = Some(Error::ExecutionTimeout(self.timeout.as_secs()).to_string());
                break;
            };

            let kind = match self.resolve_action_kind(&action.kind, &ctx) {
                Ok(kind) => kind,
                Err(e) => {
                    let message =
                        format!("action '{}' failed: {}", action.kind.type_name(), e);
                    error!(%message, "parameter resolution failed");
                    trace.push(json!({
                        "action_type": action.kind.type_name(),
                        "sort_order": action.sort_order,
                        "status": "error",
                        "error": message.clone(),
                    }));
                    failure = Some(message);
                    break;
                }
            };

            let connector = self.connectors.for_service(action.target);
            info!(
                action_type = kind.type_name(),
                target = %action.target,
                "running action"
            );

            let outcome =
                tokio::time::timeout(remaining, run_action(&kind, connector, &ctx, &self.storage))
                    .await;

            match outcome {
                Ok(Ok(result)) => {
                    trace.push(json!({
                        "action_type": kind.type_name(),
                        "sort_order": action.sort_order,
                        "status": "success",
                        "result": result.clone(),
                    }));
                    ctx.push_output(result);
                }
                Ok(Err(e)) => {
                    // Captured verbatim: the connector error carries
                    // service, operation and status.
                    let message = format!("action '{}' failed: {}", kind.type_name(), e);
                    error!(%message, "aborting remaining actions");
                    trace.push(json!({
                        "action_type": kind.type_name(),
                        "sort_order": action.sort_order,
                        "status": "error",
                        "error": message.clone(),
                    }));
                    failure = Some(message);
                    break;
                }
                Err(_elapsed) => {
                    let message = format!(
                        "action '{}' failed: {}",
                        kind.type_name(),
                        Error::ExecutionTimeout(self.timeout.as_secs())
                    );
                    error!(%message, "deadline expired mid-action");
                    trace.push(json!({
                        "action_type": kind.type_name(),
                        "sort_order": action.sort_order,
                        "status": "error",
                        "error": message.clone(),
                    }));
                    failure = Some(message);
                    break;
                }
            }
        }

        let log = match failure {
            None => {
                info!(
                    actions = trace.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "execution succeeded"
                );
                WorkflowLog::new(
                    Some(workflow.id),
                    Some(workflow.name.clone()),
                    LogStatus::Success,
                    input,
                )
                .with_output(json!({ "actions": trace }))
            }
            Some(message) => WorkflowLog::new(
                Some(workflow.id),
                Some(workflow.name.clone()),
                LogStatus::Error,
                input,
            )
            .with_output(json!({ "actions": trace }))
            .with_error(message),
        };

        self.storage.save_log(&log).await?;
        Ok(log)
    }

    /// Record a skipped attempt (conditions false, workflow disabled, no
    /// matching workflow) without running anything.
    pub async fn record_skipped(
        &self,
        workflow: Option<&Workflow>,
        event: &Event,
        reason: &str,
    ) -> Result<WorkflowLog> {
        let log = WorkflowLog::skipped(
            workflow.map(|w| w.id),
            workflow.map(|w| w.name.clone()),
            serde_json::to_value(event)?,
            reason,
        );
        self.storage.save_log(&log).await?;
        Ok(log)
    }

    /// Substitute `{{ path }}` references in the action's parameters and
    /// re-parse into the typed catalog entry.
    fn resolve_action_kind(&self, kind: &ActionKind, ctx: &RunContext) -> Result<ActionKind> {
        let raw = serde_json::to_value(kind)?;
        let resolved = ctx.resolve(&raw);
        serde_json::from_value(resolved)
            .map_err(|e| Error::Internal(format!("resolved parameters are invalid: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::Connector;
    use crate::testing::{malformed, MockConnector};
    use crate::workflow::{
        Action, AddTagParams, CreateVoucherParams, EventSource, ServiceKind, Trigger,
        UploadAttachmentParams,
    };
    use base64::Engine as _;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Harness {
        executor: Executor,
        paperless: Arc<MockConnector>,
        lexoffice: Arc<MockConnector>,
        storage: SqliteStorage,
    }

    fn harness() -> Harness {
        harness_with(
            MockConnector::new(ServiceKind::Paperless),
            MockConnector::new(ServiceKind::Lexoffice),
        )
    }

    fn harness_with(paperless: MockConnector, lexoffice: MockConnector) -> Harness {
        let paperless = Arc::new(paperless);
        let lexoffice = Arc::new(lexoffice);
        let storage = SqliteStorage::open_in_memory().unwrap();
        let connectors = Connectors {
            paperless: paperless.clone() as Arc<dyn Connector>,
            lexoffice: lexoffice.clone() as Arc<dyn Connector>,
        };
        Harness {
            executor: Executor::new(connectors, storage.clone()),
            paperless,
            lexoffice,
            storage,
        }
    }

    fn workflow(actions: Vec<Action>) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            name: "voucher-pipeline".to_string(),
            description: None,
            enabled: true,
            triggers: vec![Trigger {
                id: Uuid::new_v4(),
                source: EventSource::Paperless,
                event_type: "document_added".to_string(),
                conditions: None,
                schedule: None,
                sort_order: 0,
            }],
            actions,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn create_voucher_action(sort_order: i32) -> Action {
        Action {
            id: Uuid::new_v4(),
            target: ServiceKind::Lexoffice,
            sort_order,
            kind: ActionKind::CreateVoucher(CreateVoucherParams {
                voucher_type: "purchaseinvoice".to_string(),
                voucher_number: Some(json!("{{ event.document_id }}")),
                voucher_date: None,
                total_gross_amount: Some(json!(119.0)),
                tax_type: "gross".to_string(),
                voucher_items: None,
                contact_id: None,
            }),
        }
    }

    fn upload_attachment_action(sort_order: i32) -> Action {
        let content = base64::engine::general_purpose::STANDARD.encode(b"pdf bytes");
        Action {
            id: Uuid::new_v4(),
            target: ServiceKind::Lexoffice,
            sort_order,
            kind: ActionKind::UploadAttachment(UploadAttachmentParams {
                voucher_id: Some(json!("{{ voucher.id }}")),
                filename: Some(json!("rechnung.pdf")),
                content: Some(json!(content)),
            }),
        }
    }

    fn document_event() -> Event {
        Event::new(
            EventSource::Paperless,
            "document_added",
            json!({"document_id": 42}),
        )
    }

    #[tokio::test]
    async fn actions_run_in_order_and_chain_outputs() {
        let h = harness();
        let wf = workflow(vec![
            create_voucher_action(1),
            upload_attachment_action(2),
        ]);

        let log = h.executor.execute(&wf, &document_event()).await.unwrap();
        assert_eq!(log.status, LogStatus::Success);

        assert_eq!(
            h.lexoffice.calls(),
            vec!["create voucher", "upload attachment"]
        );

        // The upload referenced the voucher id returned by the first action.
        let trace = &log.output.as_ref().unwrap()["actions"];
        let voucher_id = &trace[0]["result"]["voucher"]["id"];
        assert_eq!(&trace[1]["result"]["attachment"]["owner"], voucher_id);
        // And the template pulled the event field into the voucher.
        assert_eq!(trace[0]["result"]["voucher"]["voucherNumber"], "42");
    }

    #[tokio::test]
    async fn first_failure_aborts_remaining_actions() {
        // create_voucher answers 422: upload_attachment must never run,
        // and the log must name the action and the upstream status.
        let h = harness();
        h.lexoffice.fail_operation(
            "create voucher",
            malformed(ServiceKind::Lexoffice, "create voucher", 422),
        );
        let wf = workflow(vec![
            create_voucher_action(1),
            upload_attachment_action(2),
        ]);

        let log = h.executor.execute(&wf, &document_event()).await.unwrap();
        assert_eq!(log.status, LogStatus::Error);

        let message = log.error_message.as_deref().unwrap();
        assert!(message.contains("create_voucher"), "got: {message}");
        assert!(message.contains("422"), "got: {message}");
        assert!(message.contains("lexoffice"), "got: {message}");

        assert_eq!(h.lexoffice.calls(), vec!["create voucher"]);

        // The trace still records the attempted action.
        let trace = log.output.as_ref().unwrap()["actions"].as_array().unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0]["status"], "error");
    }

    #[tokio::test]
    async fn contended_lock_resolves_to_skipped_without_side_effects() {
        let h = harness_with(
            MockConnector::new(ServiceKind::Paperless),
            MockConnector::new(ServiceKind::Lexoffice)
                .with_delay(Duration::from_millis(200)),
        );
        let executor = Arc::new(h.executor);
        let wf = Arc::new(workflow(vec![create_voucher_action(1)]));

        let first = {
            let executor = executor.clone();
            let wf = wf.clone();
            tokio::spawn(async move { executor.execute(&wf, &document_event()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = executor.execute(&wf, &document_event()).await.unwrap();
        assert_eq!(second.status, LogStatus::Skipped);
        assert_eq!(
            second.output.as_ref().unwrap()["reason"],
            REASON_ALREADY_RUNNING
        );

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, LogStatus::Success);

        // Exactly one voucher was created across both attempts.
        assert_eq!(h.lexoffice.calls(), vec!["create voucher"]);
        assert_eq!(h.storage.list_logs(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deadline_expiry_fails_the_run_with_timeout_reason() {
        let h = harness_with(
            MockConnector::new(ServiceKind::Paperless),
            MockConnector::new(ServiceKind::Lexoffice)
                .with_delay(Duration::from_millis(500)),
        );
        let executor = h.executor.with_timeout(Duration::from_millis(50));
        let wf = workflow(vec![create_voucher_action(1)]);

        let log = executor.execute(&wf, &document_event()).await.unwrap();
        assert_eq!(log.status, LogStatus::Error);
        assert!(log
            .error_message
            .as_deref()
            .unwrap()
            .contains("execution timeout"));
    }

    #[tokio::test]
    async fn downloaded_file_content_feeds_later_upload() {
        use crate::workflow::DownloadDocumentParams;

        let h = harness();
        let wf = workflow(vec![
            Action {
                id: Uuid::new_v4(),
                target: ServiceKind::Paperless,
                sort_order: 1,
                kind: ActionKind::DownloadDocument(DownloadDocumentParams {
                    document_id: None, // falls back to the event's document_id
                }),
            },
            Action {
                id: Uuid::new_v4(),
                target: ServiceKind::Lexoffice,
                sort_order: 2,
                kind: ActionKind::UploadAttachment(UploadAttachmentParams {
                    voucher_id: Some(json!("v-9")),
                    filename: None, // falls back to the downloaded filename
                    content: None,  // falls back to the downloaded file_content
                }),
            },
        ]);

        let log = h.executor.execute(&wf, &document_event()).await.unwrap();
        assert_eq!(log.status, LogStatus::Success);
        assert_eq!(h.paperless.calls(), vec!["download", "fetch document"]);
        assert_eq!(h.lexoffice.calls(), vec!["upload attachment"]);

        let trace = &log.output.as_ref().unwrap()["actions"];
        assert_eq!(trace[0]["result"]["filename"], "42.pdf");
        assert_eq!(trace[1]["result"]["attachment"]["filename"], "42.pdf");
        assert_eq!(trace[1]["result"]["attachment"]["owner"], "v-9");
    }

    #[tokio::test]
    async fn sync_contact_records_mapping_when_correspondent_known() {
        use crate::workflow::SyncContactParams;

        let h = harness();
        let wf = workflow(vec![Action {
            id: Uuid::new_v4(),
            target: ServiceKind::Lexoffice,
            sort_order: 1,
            kind: ActionKind::SyncContact(SyncContactParams {
                correspondent_name: None, // falls back to the event field
            }),
        }]);
        let event = Event::new(
            EventSource::Paperless,
            "document_added",
            json!({"correspondent_name": "ACME GmbH", "correspondent_id": 7}),
        );

        let log = h.executor.execute(&wf, &event).await.unwrap();
        assert_eq!(log.status, LogStatus::Success);

        let trace = &log.output.as_ref().unwrap()["actions"];
        assert_eq!(trace[0]["result"]["created"], true);

        let mappings = h.storage.list_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].paperless_correspondent_id, "7");

        // Lexoffice now holds the created contact.
        assert_eq!(h.lexoffice.contacts()[0].name, "ACME GmbH");
    }

    #[tokio::test]
    async fn exhausted_transient_error_is_not_retried_by_the_executor() {
        // Retries live in the connector dispatch layer; by the time an
        // error reaches the executor it is final, whatever its kind.
        let h = harness();
        h.lexoffice.fail_operation(
            "create voucher",
            crate::testing::transient(ServiceKind::Lexoffice, "create voucher"),
        );
        let wf = workflow(vec![create_voucher_action(1)]);

        let log = h.executor.execute(&wf, &document_event()).await.unwrap();
        assert_eq!(log.status, LogStatus::Error);
        assert_eq!(h.lexoffice.calls(), vec!["create voucher"]);
    }

    #[tokio::test]
    async fn workflow_without_actions_succeeds_with_empty_trace() {
        let h = harness();
        let wf = workflow(vec![]);

        let log = h.executor.execute(&wf, &document_event()).await.unwrap();
        assert_eq!(log.status, LogStatus::Success);
        assert_eq!(
            log.output.as_ref().unwrap()["actions"],
            json!([])
        );
        assert!(h.paperless.calls().is_empty());
        assert!(h.lexoffice.calls().is_empty());
    }

    #[tokio::test]
    async fn soft_parameter_gaps_do_not_abort_the_run() {
        // add_tag without a resolvable document id records a soft result
        // and the run continues to the next action.
        let h = harness();
        let wf = workflow(vec![
            Action {
                id: Uuid::new_v4(),
                target: ServiceKind::Paperless,
                sort_order: 1,
                kind: ActionKind::AddTag(AddTagParams {
                    document_id: None,
                    tag_id: None,
                }),
            },
            create_voucher_action(2),
        ]);
        let event = Event::new(EventSource::Paperless, "document_added", json!({}));

        let log = h.executor.execute(&wf, &event).await.unwrap();
        assert_eq!(log.status, LogStatus::Success);
        let trace = log.output.as_ref().unwrap()["actions"].as_array().unwrap();
        assert_eq!(trace[0]["result"]["tagged"], false);
        assert_eq!(h.lexoffice.calls(), vec!["create voucher"]);
    }
}
