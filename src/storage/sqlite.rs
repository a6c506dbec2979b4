//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::*;
use crate::error::{Error, Result};
use crate::workflow::{validate_workflow, ServiceKind, Workflow};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                definition TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_logs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT,
                workflow_name TEXT,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                error_message TEXT,
                executed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_logs_workflow
                ON workflow_logs(workflow_id, executed_at DESC);

            CREATE TABLE IF NOT EXISTS contact_mappings (
                id TEXT PRIMARY KEY,
                paperless_correspondent_id TEXT NOT NULL UNIQUE,
                lexoffice_contact_id TEXT NOT NULL UNIQUE,
                last_synced_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS connector_configs (
                id TEXT PRIMARY KEY,
                connector_type TEXT NOT NULL UNIQUE,
                base_url TEXT NOT NULL,
                api_token TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reconciliation_runs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                paperless_contacts_seen INTEGER NOT NULL,
                lexoffice_contacts_seen INTEGER NOT NULL,
                mappings_created INTEGER NOT NULL,
                paperless_contacts_created INTEGER NOT NULL,
                lexoffice_contacts_created INTEGER NOT NULL,
                conflicts TEXT NOT NULL,
                error_message TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_reconciliation_runs_started
                ON reconciliation_runs(started_at DESC);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    /// Validate and persist a workflow definition (insert or replace).
    ///
    /// Rejecting malformed definitions here keeps them from ever becoming
    /// runnable; the engine only sees definitions that passed validation.
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        validate_workflow(workflow)?;
        let definition = serde_json::to_string(workflow)?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO workflows (id, name, definition, enabled, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   definition = excluded.definition,
                   enabled = excluded.enabled,
                   updated_at = excluded.updated_at"#,
            params![
                workflow.id.to_string(),
                workflow.name,
                definition,
                workflow.enabled as i64,
                workflow.created_at.to_rfc3339(),
                workflow.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let conn = self.conn.lock().await;
        let definition: Option<String> = conn
            .query_row(
                "SELECT definition FROM workflows WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        definition
            .map(|d| serde_json::from_str(&d).map_err(|e| Error::Storage(e.to_string())))
            .transpose()
    }

    /// All enabled workflows in ascending creation order, the order the
    /// trigger matcher returns candidates in.
    pub async fn list_enabled_workflows(&self) -> Result<Vec<Workflow>> {
        self.list_workflows_filtered(true).await
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        self.list_workflows_filtered(false).await
    }

    async fn list_workflows_filtered(&self, enabled_only: bool) -> Result<Vec<Workflow>> {
        let conn = self.conn.lock().await;
        let sql = if enabled_only {
            "SELECT definition FROM workflows WHERE enabled = 1 ORDER BY created_at ASC, id ASC"
        } else {
            "SELECT definition FROM workflows ORDER BY created_at ASC, id ASC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut workflows = Vec::new();
        for definition in rows {
            let workflow = serde_json::from_str(&definition?)
                .map_err(|e| Error::Storage(format!("corrupt workflow definition: {e}")))?;
            workflows.push(workflow);
        }
        Ok(workflows)
    }

    pub async fn delete_workflow(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM workflows WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Workflow logs (append-only)
    // ------------------------------------------------------------------

    pub async fn save_log(&self, log: &WorkflowLog) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO workflow_logs
               (id, workflow_id, workflow_name, status, input, output, error_message, executed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                log.id.to_string(),
                log.workflow_id.map(|id| id.to_string()),
                log.workflow_name,
                log.status.to_string(),
                serde_json::to_string(&log.input)?,
                log.output
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                log.error_message,
                log.executed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_logs(&self, limit: usize) -> Result<Vec<WorkflowLog>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, workflow_name, status, input, output, error_message, executed_at
             FROM workflow_logs ORDER BY executed_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_log)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub async fn list_logs_for_workflow(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowLog>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, workflow_name, status, input, output, error_message, executed_at
             FROM workflow_logs WHERE workflow_id = ?1 ORDER BY executed_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![workflow_id.to_string(), limit as i64], row_to_log)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Contact mappings
    // ------------------------------------------------------------------

    /// Insert a new mapping row. Fails if either external id is already
    /// mapped; each side is unique independently.
    pub async fn insert_mapping(&self, mapping: &ContactMapping) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO contact_mappings
               (id, paperless_correspondent_id, lexoffice_contact_id, last_synced_at, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                mapping.id.to_string(),
                mapping.paperless_correspondent_id,
                mapping.lexoffice_contact_id,
                mapping.last_synced_at.to_rfc3339(),
                mapping.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn touch_mapping(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE contact_mappings SET last_synced_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub async fn list_mappings(&self) -> Result<Vec<ContactMapping>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, paperless_correspondent_id, lexoffice_contact_id, last_synced_at, created_at
             FROM contact_mappings ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ContactMapping {
                id: parse_uuid(&row.get::<_, String>(0)?)?,
                paperless_correspondent_id: row.get(1)?,
                lexoffice_contact_id: row.get(2)?,
                last_synced_at: parse_datetime_utc(&row.get::<_, String>(3)?)?,
                created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Connector configs
    // ------------------------------------------------------------------

    pub async fn upsert_connector_config(&self, config: &ConnectorConfig) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO connector_configs
               (id, connector_type, base_url, api_token, active, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
               ON CONFLICT(connector_type) DO UPDATE SET
                   base_url = excluded.base_url,
                   api_token = excluded.api_token,
                   active = excluded.active,
                   updated_at = excluded.updated_at"#,
            params![
                config.id.to_string(),
                config.connector_type.to_string(),
                config.base_url,
                config.api_token,
                config.active as i64,
                config.created_at.to_rfc3339(),
                config.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_connector_config(
        &self,
        service: ServiceKind,
    ) -> Result<Option<ConnectorConfig>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, connector_type, base_url, api_token, active, created_at, updated_at
             FROM connector_configs WHERE connector_type = ?1",
            params![service.to_string()],
            row_to_connector_config,
        )
        .optional()
        .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Reconciliation runs (append-only)
    // ------------------------------------------------------------------

    pub async fn save_reconciliation_run(&self, run: &ReconciliationRun) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO reconciliation_runs
               (id, status, paperless_contacts_seen, lexoffice_contacts_seen, mappings_created,
                paperless_contacts_created, lexoffice_contacts_created, conflicts, error_message,
                started_at, finished_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                run.id.to_string(),
                run.status.to_string(),
                run.paperless_contacts_seen,
                run.lexoffice_contacts_seen,
                run.mappings_created,
                run.paperless_contacts_created,
                run.lexoffice_contacts_created,
                serde_json::to_string(&run.conflicts)?,
                run.error_message,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn list_reconciliation_runs(&self, limit: usize) -> Result<Vec<ReconciliationRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, status, paperless_contacts_seen, lexoffice_contacts_seen, mappings_created,
                    paperless_contacts_created, lexoffice_contacts_created, conflicts,
                    error_message, started_at, finished_at
             FROM reconciliation_runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ReconciliationRun {
                id: parse_uuid(&row.get::<_, String>(0)?)?,
                status: row
                    .get::<_, String>(1)?
                    .parse()
                    .map_err(|e: String| text_conversion_error(e))?,
                paperless_contacts_seen: row.get(2)?,
                lexoffice_contacts_seen: row.get(3)?,
                mappings_created: row.get(4)?,
                paperless_contacts_created: row.get(5)?,
                lexoffice_contacts_created: row.get(6)?,
                conflicts: serde_json::from_str(&row.get::<_, String>(7)?)
                    .map_err(|e| text_conversion_error(e.to_string()))?,
                error_message: row.get(8)?,
                started_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
                finished_at: row
                    .get::<_, Option<String>>(10)?
                    .map(|s| parse_datetime_utc(&s))
                    .transpose()?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn text_conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowLog> {
    Ok(WorkflowLog {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        workflow_id: row
            .get::<_, Option<String>>(1)?
            .map(|s| parse_uuid(&s))
            .transpose()?,
        workflow_name: row.get(2)?,
        status: row
            .get::<_, String>(3)?
            .parse()
            .map_err(|e: String| text_conversion_error(e))?,
        input: serde_json::from_str(&row.get::<_, String>(4)?)
            .map_err(|e| text_conversion_error(e.to_string()))?,
        output: row
            .get::<_, Option<String>>(5)?
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| text_conversion_error(e.to_string()))?,
        error_message: row.get(6)?,
        executed_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
    })
}

fn row_to_connector_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectorConfig> {
    let connector_type = match row.get::<_, String>(1)?.as_str() {
        "paperless" => ServiceKind::Paperless,
        "lexoffice" => ServiceKind::Lexoffice,
        other => return Err(text_conversion_error(format!("unknown connector: {other}"))),
    };
    Ok(ConnectorConfig {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        connector_type,
        base_url: row.get(2)?,
        api_token: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
        updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
    })
}
