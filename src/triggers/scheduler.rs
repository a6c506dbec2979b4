//! Cron scheduler for schedule-sourced triggers.
//!
//! Each schedule trigger becomes a cron job that injects a tick event
//! into the same dispatch pipeline as webhooks, addressed to its owning
//! workflow. Overlap prevention lives in the executor's per-workflow
//! lock: a tick that lands while a previous run is still going is logged
//! as skipped, never queued. The contact reconciliation cadence is just
//! another job here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::Dispatcher;
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use crate::sync::ContactReconciler;
use crate::workflow::{Event, EventSource, Workflow};

/// Cadence used when a schedule trigger does not carry its own cron
/// expression (seconds-resolution, every 15 minutes).
pub const DEFAULT_SCHEDULE: &str = "0 */15 * * * *";

/// Manages cron jobs for schedule triggers and the reconciliation pass.
pub struct Scheduler {
    job_scheduler: Arc<Mutex<JobScheduler>>,
    /// Workflow id → job ids, for unregistration on definition changes.
    jobs: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
    storage: SqliteStorage,
    dispatcher: Dispatcher,
    reconciliation: Option<(Arc<ContactReconciler>, String)>,
}

impl Scheduler {
    pub async fn new(storage: SqliteStorage, dispatcher: Dispatcher) -> Result<Self> {
        let job_scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Internal(format!("failed to create scheduler: {e}")))?;

        Ok(Self {
            job_scheduler: Arc::new(Mutex::new(job_scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            storage,
            dispatcher,
            reconciliation: None,
        })
    }

    /// Register the periodic contact reconciliation pass.
    pub fn with_reconciliation(mut self, reconciler: Arc<ContactReconciler>, cron: &str) -> Self {
        self.reconciliation = Some((reconciler, cron.to_string()));
        self
    }

    /// Load all enabled workflows, register their schedule triggers, and
    /// start ticking.
    pub async fn start(&self) -> Result<()> {
        info!("starting scheduler");

        let workflows = self.storage.list_enabled_workflows().await?;
        let mut registered = 0usize;
        for workflow in &workflows {
            registered += self.register_workflow(workflow).await?;
        }

        if let Some((reconciler, cron)) = &self.reconciliation {
            self.add_reconciliation_job(reconciler.clone(), cron).await?;
            registered += 1;
        }

        {
            let sched = self.job_scheduler.lock().await;
            sched
                .start()
                .await
                .map_err(|e| Error::Internal(format!("failed to start scheduler: {e}")))?;
        }

        info!(jobs = registered, "scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut sched = self.job_scheduler.lock().await;
        sched
            .shutdown()
            .await
            .map_err(|e| Error::Internal(format!("failed to stop scheduler: {e}")))?;
        info!("scheduler stopped");
        Ok(())
    }

    /// Register every schedule trigger of one workflow. Returns the
    /// number of jobs added.
    pub async fn register_workflow(&self, workflow: &Workflow) -> Result<usize> {
        let mut job_ids = Vec::new();

        for trigger in &workflow.triggers {
            if trigger.source != EventSource::Schedule {
                continue;
            }
            let cron = trigger.schedule.as_deref().unwrap_or(DEFAULT_SCHEDULE);
            let job_id = self
                .add_tick_job(workflow.id, &workflow.name, &trigger.event_type, cron)
                .await?;
            job_ids.push(job_id);
        }

        let added = job_ids.len();
        if added > 0 {
            self.jobs.write().await.insert(workflow.id, job_ids);
        }
        Ok(added)
    }

    /// Remove all jobs registered for a workflow.
    pub async fn unregister_workflow(&self, workflow_id: Uuid) -> Result<()> {
        if let Some(job_ids) = self.jobs.write().await.remove(&workflow_id) {
            let sched = self.job_scheduler.lock().await;
            for job_id in job_ids {
                if let Err(e) = sched.remove(&job_id).await {
                    warn!(%job_id, error = %e, "failed to remove job");
                }
            }
            info!(%workflow_id, "unregistered schedule triggers");
        }
        Ok(())
    }

    async fn add_tick_job(
        &self,
        workflow_id: Uuid,
        workflow_name: &str,
        event_type: &str,
        cron: &str,
    ) -> Result<Uuid> {
        let dispatcher = self.dispatcher.clone();
        let event_type = event_type.to_string();
        let name_for_log = workflow_name.to_string();

        let job = Job::new_async(cron, move |_job_id, _scheduler| {
            let dispatcher = dispatcher.clone();
            let event_type = event_type.clone();
            let workflow_name = name_for_log.clone();
            Box::pin(async move {
                let event = Event::schedule_tick(workflow_id, &event_type, Utc::now());
                match dispatcher.dispatch_scheduled(workflow_id, event).await {
                    Ok(Some(log)) => {
                        info!(%workflow_name, status = %log.status, "schedule tick dispatched")
                    }
                    Ok(None) => warn!(%workflow_name, "schedule tick found no workflow"),
                    Err(e) => error!(%workflow_name, error = %e, "schedule tick failed"),
                }
            })
        })
        .map_err(|e| {
            Error::Config(format!(
                "invalid cron expression '{cron}' for workflow '{workflow_name}': {e}"
            ))
        })?;

        let job_id = job.guid();
        {
            let sched = self.job_scheduler.lock().await;
            sched
                .add(job)
                .await
                .map_err(|e| Error::Internal(format!("failed to add cron job: {e}")))?;
        }

        info!(%workflow_name, cron, "registered schedule trigger");
        Ok(job_id)
    }

    async fn add_reconciliation_job(
        &self,
        reconciler: Arc<ContactReconciler>,
        cron: &str,
    ) -> Result<()> {
        let job = Job::new_async(cron, move |_job_id, _scheduler| {
            let reconciler = reconciler.clone();
            Box::pin(async move {
                match reconciler.run().await {
                    Ok(run) => info!(
                        status = %run.status,
                        mappings_created = run.mappings_created,
                        "reconciliation tick finished"
                    ),
                    Err(e) => error!(error = %e, "reconciliation tick failed"),
                }
            })
        })
        .map_err(|e| Error::Config(format!("invalid reconciliation cron '{cron}': {e}")))?;

        let sched = self.job_scheduler.lock().await;
        sched
            .add(job)
            .await
            .map_err(|e| Error::Internal(format!("failed to add reconciliation job: {e}")))?;

        info!(cron, "registered reconciliation job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{Connector, Connectors};
    use crate::engine::Executor;
    use crate::testing::MockConnector;
    use crate::workflow::{ServiceKind, Trigger, SCHEDULED_RUN};

    async fn scheduler() -> Scheduler {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let connectors = Connectors {
            paperless: Arc::new(MockConnector::new(ServiceKind::Paperless)) as Arc<dyn Connector>,
            lexoffice: Arc::new(MockConnector::new(ServiceKind::Lexoffice)) as Arc<dyn Connector>,
        };
        let executor = Arc::new(Executor::new(connectors, storage.clone()));
        Scheduler::new(storage.clone(), Dispatcher::new(storage, executor))
            .await
            .unwrap()
    }

    fn scheduled_workflow(cron: Option<&str>) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            name: "nightly".to_string(),
            description: None,
            enabled: true,
            triggers: vec![Trigger {
                id: Uuid::new_v4(),
                source: EventSource::Schedule,
                event_type: SCHEDULED_RUN.to_string(),
                conditions: None,
                schedule: cron.map(str::to_string),
                sort_order: 0,
            }],
            actions: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn registers_and_unregisters_schedule_triggers() {
        let scheduler = scheduler().await;
        let workflow = scheduled_workflow(Some("0 0 3 * * *"));

        let added = scheduler.register_workflow(&workflow).await.unwrap();
        assert_eq!(added, 1);
        assert!(scheduler.jobs.read().await.contains_key(&workflow.id));

        scheduler.unregister_workflow(workflow.id).await.unwrap();
        assert!(!scheduler.jobs.read().await.contains_key(&workflow.id));
    }

    #[tokio::test]
    async fn webhook_triggers_add_no_jobs() {
        let scheduler = scheduler().await;
        let mut workflow = scheduled_workflow(None);
        workflow.triggers[0].source = EventSource::Paperless;
        workflow.triggers[0].event_type = "document_added".to_string();

        let added = scheduler.register_workflow(&workflow).await.unwrap();
        assert_eq!(added, 0);
        assert!(scheduler.jobs.read().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_cron_is_a_configuration_error() {
        let scheduler = scheduler().await;
        let workflow = scheduled_workflow(Some("not a cron"));

        let err = scheduler.register_workflow(&workflow).await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
