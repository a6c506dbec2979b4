//! Trigger matching.
//!
//! Selects candidate workflows for an incoming event. Matching is purely
//! structural (source and event type); condition evaluation is a separate
//! stage so it stays independently testable.

use crate::workflow::{Event, Trigger, Workflow};

/// One candidate: a workflow together with the trigger that matched.
#[derive(Debug)]
pub struct TriggerMatch<'a> {
    pub workflow: &'a Workflow,
    pub trigger: &'a Trigger,
}

/// Match an event against a set of workflow definitions.
///
/// A trigger is a candidate iff its source and event type equal the
/// event's, and its workflow is enabled. Within a workflow, triggers are
/// examined in `sort_order` and the first match represents the workflow.
/// Candidates are returned in ascending workflow creation order so
/// dispatch is deterministic; callers execute them independently.
pub fn match_event<'a>(workflows: &'a [Workflow], event: &Event) -> Vec<TriggerMatch<'a>> {
    let mut candidates: Vec<TriggerMatch<'a>> = workflows
        .iter()
        .filter(|w| w.enabled)
        .filter_map(|workflow| {
            workflow
                .triggers_ordered()
                .into_iter()
                .find(|t| t.matches(event))
                .map(|trigger| TriggerMatch { workflow, trigger })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.workflow
            .created_at
            .cmp(&b.workflow.created_at)
            .then_with(|| a.workflow.id.cmp(&b.workflow.id))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::conditions::{Comparison, Condition, Operator};
    use crate::workflow::{EventSource, Workflow};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn trigger(source: EventSource, event_type: &str, sort_order: i32) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            source,
            event_type: event_type.to_string(),
            conditions: None,
            schedule: None,
            sort_order,
        }
    }

    fn workflow(name: &str, triggers: Vec<Trigger>, age_hours: i64) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            enabled: true,
            triggers,
            actions: vec![],
            created_at: Utc::now() - Duration::hours(age_hours),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn matches_on_source_and_event_type() {
        let workflows = vec![
            workflow(
                "paperless-added",
                vec![trigger(EventSource::Paperless, "document_added", 0)],
                1,
            ),
            workflow(
                "lexoffice-voucher",
                vec![trigger(EventSource::Lexoffice, "voucher.created", 0)],
                1,
            ),
        ];
        let event = Event::new(EventSource::Paperless, "document_added", json!({}));

        let matches = match_event(&workflows, &event);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].workflow.name, "paperless-added");
    }

    #[test]
    fn disabled_workflows_are_never_candidates() {
        let mut wf = workflow(
            "disabled",
            vec![trigger(EventSource::Paperless, "document_added", 0)],
            1,
        );
        wf.enabled = false;
        let event = Event::new(EventSource::Paperless, "document_added", json!({}));

        assert!(match_event(&[wf], &event).is_empty());
    }

    #[test]
    fn candidates_ordered_by_workflow_creation_time() {
        let workflows = vec![
            workflow(
                "newer",
                vec![trigger(EventSource::Paperless, "document_added", 0)],
                1,
            ),
            workflow(
                "older",
                vec![trigger(EventSource::Paperless, "document_added", 0)],
                48,
            ),
        ];
        let event = Event::new(EventSource::Paperless, "document_added", json!({}));

        let matches = match_event(&workflows, &event);
        let names: Vec<&str> = matches.iter().map(|m| m.workflow.name.as_str()).collect();
        assert_eq!(names, vec!["older", "newer"]);
    }

    #[test]
    fn first_trigger_in_sort_order_represents_the_workflow() {
        let mut high_priority = trigger(EventSource::Paperless, "document_added", 0);
        high_priority.conditions = Some(Condition::Leaf(Comparison {
            field: "tags".to_string(),
            operator: Operator::Contains,
            value: Some(json!("Rechnung")),
        }));
        let low_priority = trigger(EventSource::Paperless, "document_added", 5);
        let marker = high_priority.id;

        let wf = workflow("priorities", vec![low_priority, high_priority], 1);
        let event = Event::new(EventSource::Paperless, "document_added", json!({}));

        let matches = match_event(std::slice::from_ref(&wf), &event);
        assert_eq!(matches[0].trigger.id, marker);
    }

    #[test]
    fn no_candidates_is_an_empty_list_not_an_error() {
        let event = Event::new(EventSource::Lexoffice, "voucher.created", json!({}));
        assert!(match_event(&[], &event).is_empty());
    }
}
