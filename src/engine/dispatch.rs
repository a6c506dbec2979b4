//! Event dispatch.
//!
//! The single entry point for both event sources: webhook deliveries fan
//! out to every matching workflow, schedule ticks address one workflow.
//! Distinct workflows execute concurrently; the per-workflow lock inside
//! the executor serializes attempts against any single workflow.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::conditions::evaluate;
use crate::engine::executor::Executor;
use crate::engine::matcher::match_event;
use crate::error::Result;
use crate::storage::{SqliteStorage, WorkflowLog};
use crate::workflow::Event;

/// Reason recorded when an event matches nothing.
pub const REASON_NO_MATCH: &str = "no matching workflow";
/// Reason recorded when a matched trigger's conditions evaluate false.
pub const REASON_CONDITIONS: &str = "conditions not met";
/// Reason recorded when a schedule tick addresses a disabled workflow.
pub const REASON_DISABLED: &str = "workflow is disabled";

/// Routes events through matching, condition evaluation and execution.
#[derive(Clone)]
pub struct Dispatcher {
    storage: SqliteStorage,
    executor: Arc<Executor>,
}

impl Dispatcher {
    pub fn new(storage: SqliteStorage, executor: Arc<Executor>) -> Self {
        Self { storage, executor }
    }

    /// Dispatch a webhook event to every matching workflow.
    ///
    /// Matching workflows execute concurrently and independently; one
    /// workflow's failure never blocks another's. Returns the log record
    /// of every attempt, including skips.
    pub async fn dispatch(&self, event: Event) -> Result<Vec<WorkflowLog>> {
        let workflows = self.storage.list_enabled_workflows().await?;
        let matches = match_event(&workflows, &event);

        if matches.is_empty() {
            info!(source = %event.source, event_type = %event.event_type, "no matching workflow");
            let log = self.executor.record_skipped(None, &event, REASON_NO_MATCH).await?;
            return Ok(vec![log]);
        }

        let mut logs = Vec::new();
        let mut running: JoinSet<Result<WorkflowLog>> = JoinSet::new();

        for candidate in matches {
            if !evaluate(candidate.trigger.conditions.as_ref(), &event.payload) {
                info!(
                    workflow_name = %candidate.workflow.name,
                    "trigger matched but conditions evaluated false"
                );
                logs.push(
                    self.executor
                        .record_skipped(Some(candidate.workflow), &event, REASON_CONDITIONS)
                        .await?,
                );
                continue;
            }

            let executor = self.executor.clone();
            let workflow = candidate.workflow.clone();
            let event = event.clone();
            running.spawn(async move { executor.execute(&workflow, &event).await });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(log)) => logs.push(log),
                Ok(Err(e)) => warn!(error = %e, "execution attempt failed before logging"),
                Err(e) => warn!(error = %e, "execution task panicked"),
            }
        }

        Ok(logs)
    }

    /// Dispatch a schedule tick to its owning workflow.
    pub async fn dispatch_scheduled(
        &self,
        workflow_id: Uuid,
        event: Event,
    ) -> Result<Option<WorkflowLog>> {
        let Some(workflow) = self.storage.get_workflow(workflow_id).await? else {
            warn!(%workflow_id, "schedule tick for unknown workflow");
            return Ok(None);
        };

        if !workflow.enabled {
            let log = self
                .executor
                .record_skipped(Some(&workflow), &event, REASON_DISABLED)
                .await?;
            return Ok(Some(log));
        }

        // The tick belongs to a specific schedule trigger; honor its
        // conditions like any other trigger.
        let trigger = workflow
            .triggers_ordered()
            .into_iter()
            .find(|t| t.matches(&event));
        if let Some(trigger) = trigger {
            if !evaluate(trigger.conditions.as_ref(), &event.payload) {
                let log = self
                    .executor
                    .record_skipped(Some(&workflow), &event, REASON_CONDITIONS)
                    .await?;
                return Ok(Some(log));
            }
        }

        let log = self.executor.execute(&workflow, &event).await?;
        Ok(Some(log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{Connector, Connectors};
    use crate::engine::conditions::{Comparison, Condition, Operator};
    use crate::storage::LogStatus;
    use crate::testing::MockConnector;
    use crate::workflow::{EventSource, ServiceKind, Trigger, Workflow, SCHEDULED_RUN};
    use chrono::Utc;
    use serde_json::json;

    fn dispatcher() -> (Dispatcher, SqliteStorage) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let connectors = Connectors {
            paperless: Arc::new(MockConnector::new(ServiceKind::Paperless)) as Arc<dyn Connector>,
            lexoffice: Arc::new(MockConnector::new(ServiceKind::Lexoffice)) as Arc<dyn Connector>,
        };
        let executor = Arc::new(Executor::new(connectors, storage.clone()));
        (Dispatcher::new(storage.clone(), executor), storage)
    }

    fn tagged_workflow(name: &str, conditions: Option<Condition>) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            enabled: true,
            triggers: vec![Trigger {
                id: Uuid::new_v4(),
                source: EventSource::Paperless,
                event_type: "document_tagged".to_string(),
                conditions,
                schedule: None,
                sort_order: 0,
            }],
            actions: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rechnung_condition() -> Condition {
        Condition::Leaf(Comparison {
            field: "tags".to_string(),
            operator: Operator::Contains,
            value: Some(json!("Rechnung")),
        })
    }

    #[tokio::test]
    async fn unmatched_event_records_one_skipped_log() {
        let (dispatcher, storage) = dispatcher();
        let event = Event::new(EventSource::Lexoffice, "voucher.created", json!({}));

        let logs = dispatcher.dispatch(event).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Skipped);
        assert!(logs[0].workflow_id.is_none());
        assert_eq!(logs[0].output.as_ref().unwrap()["reason"], REASON_NO_MATCH);
        assert_eq!(storage.list_logs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn matching_tag_event_fires_and_nonmatching_skips() {
        let (dispatcher, storage) = dispatcher();
        storage
            .save_workflow(&tagged_workflow("invoices", Some(rechnung_condition())))
            .await
            .unwrap();

        let hit = Event::new(
            EventSource::Paperless,
            "document_tagged",
            json!({"tags": ["Rechnung", "ABC"]}),
        );
        let logs = dispatcher.dispatch(hit).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);

        let miss = Event::new(
            EventSource::Paperless,
            "document_tagged",
            json!({"tags": ["Beleg"]}),
        );
        let logs = dispatcher.dispatch(miss).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Skipped);
        assert_eq!(logs[0].output.as_ref().unwrap()["reason"], REASON_CONDITIONS);
    }

    #[tokio::test]
    async fn empty_condition_set_fires_on_any_payload() {
        let (dispatcher, storage) = dispatcher();
        storage
            .save_workflow(&tagged_workflow("catch-all", None))
            .await
            .unwrap();

        let event = Event::new(
            EventSource::Paperless,
            "document_tagged",
            json!({"arbitrary": {"deeply": ["nested", 1, null]}}),
        );
        let logs = dispatcher.dispatch(event).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);
    }

    #[tokio::test]
    async fn multiple_matching_workflows_all_execute() {
        let (dispatcher, storage) = dispatcher();
        storage
            .save_workflow(&tagged_workflow("first", None))
            .await
            .unwrap();
        storage
            .save_workflow(&tagged_workflow("second", None))
            .await
            .unwrap();

        let event = Event::new(EventSource::Paperless, "document_tagged", json!({}));
        let logs = dispatcher.dispatch(event).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.status == LogStatus::Success));
    }

    #[tokio::test]
    async fn scheduled_tick_on_disabled_workflow_is_skipped() {
        let (dispatcher, storage) = dispatcher();
        let mut wf = tagged_workflow("scheduled", None);
        wf.enabled = false;
        wf.triggers[0].source = EventSource::Schedule;
        wf.triggers[0].event_type = SCHEDULED_RUN.to_string();
        wf.triggers[0].schedule = Some("0 */15 * * * *".to_string());
        storage.save_workflow(&wf).await.unwrap();

        let event = Event::schedule_tick(wf.id, SCHEDULED_RUN, Utc::now());
        let log = dispatcher
            .dispatch_scheduled(wf.id, event)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, LogStatus::Skipped);
        assert_eq!(log.output.as_ref().unwrap()["reason"], REASON_DISABLED);
    }
}
