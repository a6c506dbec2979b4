//! Definition-time workflow validation.
//!
//! A definition that fails validation is never persisted and therefore
//! never runnable; the executor can assume every invariant checked here.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::workflow::{EventSource, Workflow};

/// Validate a workflow definition against the engine's invariants.
pub fn validate_workflow(workflow: &Workflow) -> Result<()> {
    if workflow.name.trim().is_empty() {
        return Err(Error::Validation("workflow name must not be empty".into()));
    }

    if workflow.triggers.is_empty() {
        return Err(Error::Validation(format!(
            "workflow '{}' must have at least one trigger",
            workflow.name
        )));
    }

    for trigger in &workflow.triggers {
        if trigger.event_type.trim().is_empty() {
            return Err(Error::Validation(format!(
                "workflow '{}': trigger event_type must not be empty",
                workflow.name
            )));
        }
        if let Some(schedule) = &trigger.schedule {
            if trigger.source != EventSource::Schedule {
                return Err(Error::Validation(format!(
                    "workflow '{}': only schedule triggers may carry a cron expression",
                    workflow.name
                )));
            }
            validate_cron(schedule).map_err(|e| {
                Error::Config(format!(
                    "workflow '{}': invalid cron expression '{}': {}",
                    workflow.name, schedule, e
                ))
            })?;
        }
    }

    // Action order must be strict and unique: ties would make execution
    // order ambiguous.
    let mut seen = HashSet::new();
    for action in &workflow.actions {
        if !seen.insert(action.sort_order) {
            return Err(Error::Validation(format!(
                "workflow '{}': duplicate action sort_order {}",
                workflow.name, action.sort_order
            )));
        }
        if let Some(required) = action.kind.required_target() {
            if action.target != required {
                return Err(Error::Validation(format!(
                    "workflow '{}': action '{}' must target {}, not {}",
                    workflow.name,
                    action.kind.type_name(),
                    required,
                    action.target
                )));
            }
        }
    }

    Ok(())
}

/// Shallow cron sanity check: 5 (standard) to 7 (with seconds and year)
/// whitespace-separated fields. Full parsing happens at scheduler
/// registration.
fn validate_cron(expr: &str) -> std::result::Result<(), String> {
    let fields = expr.split_whitespace().count();
    if (5..=7).contains(&fields) {
        Ok(())
    } else {
        Err(format!("expected 5-7 fields, found {fields}"))
    }
}
