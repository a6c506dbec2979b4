//! Bidirectional contact reconciliation.
//!
//! Periodically aligns Paperless correspondents with Lexoffice contacts
//! through the mapping table. Unmapped contacts on both sides are grouped
//! by normalized name (trimmed, whitespace-collapsed, lowercased) and each
//! group pairs exactly one-to-one or not at all:
//!
//! - one contact on each side → create the mapping
//! - one contact on one side, none on the other → create the counterpart,
//!   then map
//! - more than one contact on either side → record a conflict and touch
//!   nothing for that name; the engine never guesses identities
//!
//! The pass is idempotent: contacts already present in the mapping table
//! are excluded up front, so a re-run with no external changes creates
//! neither rows nor contacts.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::connectors::{Connector, Contact};
use crate::error::Result;
use crate::storage::{
    ContactMapping, LogStatus, ReconciliationConflict, ReconciliationRun, SqliteStorage,
};

/// Reason recorded when a pass is skipped due to an in-flight one.
pub const REASON_ALREADY_RUNNING: &str = "previous reconciliation still running";

/// Periodic bidirectional contact synchronization.
pub struct ContactReconciler {
    paperless: Arc<dyn Connector>,
    lexoffice: Arc<dyn Connector>,
    storage: SqliteStorage,
    /// Single-instance guard; a tick that finds the lock held is skipped.
    running: tokio::sync::Mutex<()>,
}

impl ContactReconciler {
    pub fn new(
        paperless: Arc<dyn Connector>,
        lexoffice: Arc<dyn Connector>,
        storage: SqliteStorage,
    ) -> Self {
        Self {
            paperless,
            lexoffice,
            storage,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one reconciliation pass and persist its record.
    ///
    /// Conflicts are collected, not fatal; connector failures end the pass
    /// with a status of `error`. The outcome record is always saved.
    #[instrument(name = "reconciliation.run", skip(self))]
    pub async fn run(&self) -> Result<ReconciliationRun> {
        let mut run = ReconciliationRun {
            id: Uuid::new_v4(),
            status: LogStatus::Success,
            paperless_contacts_seen: 0,
            lexoffice_contacts_seen: 0,
            mappings_created: 0,
            paperless_contacts_created: 0,
            lexoffice_contacts_created: 0,
            conflicts: Vec::new(),
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
        };

        let Ok(_guard) = self.running.try_lock() else {
            warn!("reconciliation already in flight, skipping");
            run.status = LogStatus::Skipped;
            run.error_message = Some(REASON_ALREADY_RUNNING.to_string());
            run.finished_at = Some(Utc::now());
            self.storage.save_reconciliation_run(&run).await?;
            return Ok(run);
        };

        if let Err(e) = self.execute_pass(&mut run).await {
            warn!(error = %e, "reconciliation pass failed");
            run.status = LogStatus::Error;
            run.error_message = Some(e.to_string());
        }

        run.finished_at = Some(Utc::now());
        info!(
            status = %run.status,
            mappings_created = run.mappings_created,
            conflicts = run.conflicts.len(),
            "reconciliation pass finished"
        );
        self.storage.save_reconciliation_run(&run).await?;
        Ok(run)
    }

    async fn execute_pass(&self, run: &mut ReconciliationRun) -> Result<()> {
        let paperless_contacts = self.paperless.list_contacts().await?;
        let lexoffice_contacts = self.lexoffice.list_contacts().await?;
        run.paperless_contacts_seen = paperless_contacts.len() as u32;
        run.lexoffice_contacts_seen = lexoffice_contacts.len() as u32;

        let mappings = self.storage.list_mappings().await?;
        let mapped_paperless: HashSet<&str> = mappings
            .iter()
            .map(|m| m.paperless_correspondent_id.as_str())
            .collect();
        let mapped_lexoffice: HashSet<&str> = mappings
            .iter()
            .map(|m| m.lexoffice_contact_id.as_str())
            .collect();

        // Refresh the sync stamp of mappings whose contacts still exist on
        // both sides.
        let paperless_ids: HashSet<&str> =
            paperless_contacts.iter().map(|c| c.id.as_str()).collect();
        let lexoffice_ids: HashSet<&str> =
            lexoffice_contacts.iter().map(|c| c.id.as_str()).collect();
        for mapping in &mappings {
            if paperless_ids.contains(mapping.paperless_correspondent_id.as_str())
                && lexoffice_ids.contains(mapping.lexoffice_contact_id.as_str())
            {
                self.storage.touch_mapping(mapping.id).await?;
            }
        }

        // Group unmapped contacts from both sides by normalized name.
        // BTreeMap keeps pass order deterministic.
        let mut groups: BTreeMap<String, (Vec<&Contact>, Vec<&Contact>)> = BTreeMap::new();
        for contact in &paperless_contacts {
            if !mapped_paperless.contains(contact.id.as_str()) {
                groups
                    .entry(normalize_name(&contact.name))
                    .or_default()
                    .0
                    .push(contact);
            }
        }
        for contact in &lexoffice_contacts {
            if !mapped_lexoffice.contains(contact.id.as_str()) {
                groups
                    .entry(normalize_name(&contact.name))
                    .or_default()
                    .1
                    .push(contact);
            }
        }

        for (name, (paperless_side, lexoffice_side)) in groups {
            match (paperless_side.as_slice(), lexoffice_side.as_slice()) {
                // Exactly one on each side: the pair is unambiguous.
                ([p], [l]) => {
                    self.storage
                        .insert_mapping(&ContactMapping::new(&p.id, &l.id))
                        .await?;
                    run.mappings_created += 1;
                    info!(name = %name, paperless_id = %p.id, lexoffice_id = %l.id, "mapped contacts");
                }
                // No counterpart: create it, then map.
                ([p], []) => {
                    let created = self.lexoffice.create_contact(&p.name).await?;
                    self.storage
                        .insert_mapping(&ContactMapping::new(&p.id, &created.id))
                        .await?;
                    run.lexoffice_contacts_created += 1;
                    run.mappings_created += 1;
                    info!(name = %name, lexoffice_id = %created.id, "created lexoffice counterpart");
                }
                ([], [l]) => {
                    let created = self.paperless.create_contact(&l.name).await?;
                    self.storage
                        .insert_mapping(&ContactMapping::new(&created.id, &l.id))
                        .await?;
                    run.paperless_contacts_created += 1;
                    run.mappings_created += 1;
                    info!(name = %name, paperless_id = %created.id, "created paperless counterpart");
                }
                ([], []) => unreachable!("empty groups are never inserted"),
                // Multiple candidates on either side: do not guess.
                (paperless_many, lexoffice_many) => {
                    let conflict = ReconciliationConflict {
                        name: name.clone(),
                        paperless_candidates: paperless_many
                            .iter()
                            .map(|c| (c.id.clone(), c.name.clone()))
                            .collect(),
                        lexoffice_candidates: lexoffice_many
                            .iter()
                            .map(|c| (c.id.clone(), c.name.clone()))
                            .collect(),
                    };
                    warn!(
                        name = %name,
                        paperless = conflict.paperless_candidates.len(),
                        lexoffice = conflict.lexoffice_candidates.len(),
                        "ambiguous contact match, skipping"
                    );
                    run.conflicts.push(conflict);
                }
            }
        }

        Ok(())
    }
}

/// Case-insensitive, whitespace-normalized form used for name matching.
fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
