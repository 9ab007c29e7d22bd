use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{migrate::MigrateDatabase, Row, SqliteConnection, SqlitePool};
use tracing::info;

use super::{
    AuditLogEntry, AuditQuery, RunStatePatch, StateStore, StorageError,
};
use crate::agent_state::{AgentRunState, ControlLogEntry};
use crate::leads::{Lead, LeadLifecycleState, LeadPatch};

/// SQLite-backed store for deployments that share the lead database with other tools.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database, creating it and running migrations when asked.
    pub async fn open(database_url: &str, auto_migrate: bool) -> Result<Self, StorageError> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StorageError::Unavailable {
                    reason: format!("migration failed: {e}"),
                })?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, StorageError> {
    raw.parse().map_err(|reason| StorageError::Corrupt { reason })
}

fn run_state_from_row(row: &SqliteRow) -> Result<AgentRunState, StorageError> {
    Ok(AgentRunState {
        state: parse_enum(row.try_get::<String, _>("state")?.as_str())?,
        last_transition_time: parse_ts(&row.try_get::<String, _>("last_transition_time")?)?,
        reason: row.try_get("reason")?,
        controlled_by: row.try_get("controlled_by")?,
        last_heartbeat: parse_opt_ts(row.try_get("last_heartbeat")?)?,
        error_message: row.try_get("error_message")?,
        current_task: row.try_get("current_task")?,
        discovery_query: row.try_get("discovery_query")?,
        discovery_location: row.try_get("discovery_location")?,
    })
}

fn control_entry_from_row(row: &SqliteRow) -> Result<ControlLogEntry, StorageError> {
    Ok(ControlLogEntry {
        timestamp: parse_ts(&row.try_get::<String, _>("timestamp")?)?,
        previous_state: parse_enum(row.try_get::<String, _>("previous_state")?.as_str())?,
        new_state: parse_enum(row.try_get::<String, _>("new_state")?.as_str())?,
        controlled_by: row.try_get("controlled_by")?,
        reason: row.try_get("reason")?,
        result: parse_enum(row.try_get::<String, _>("result")?.as_str())?,
    })
}

fn audit_entry_from_row(row: &SqliteRow) -> Result<AuditLogEntry, StorageError> {
    let details: Option<String> = row.try_get("details")?;
    Ok(AuditLogEntry {
        timestamp: parse_ts(&row.try_get::<String, _>("timestamp")?)?,
        module: row.try_get("module")?,
        lead_id: row.try_get("lead_id")?,
        action: row.try_get("action")?,
        result: parse_enum(row.try_get::<String, _>("result")?.as_str())?,
        details: match details {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        },
    })
}

fn lead_from_row(row: &SqliteRow) -> Result<Lead, StorageError> {
    let lifecycle: Option<String> = row.try_get("lifecycle_state")?;
    Ok(Lead {
        id: row.try_get("lead_id")?,
        business_name: row.try_get("business_name")?,
        category: row.try_get("category")?,
        location: row.try_get("location")?,
        website_url: row.try_get("website_url")?,
        email: row.try_get("email")?,
        lifecycle_state: lifecycle
            .filter(|s| !s.is_empty())
            .map(|s| parse_enum(&s))
            .transpose()?,
        review_status: parse_enum(row.try_get::<String, _>("review_status")?.as_str())?,
        outreach_status: parse_enum(row.try_get::<String, _>("outreach_status")?.as_str())?,
        discovered_at: parse_ts(&row.try_get::<String, _>("discovered_at")?)?,
        last_contacted: parse_opt_ts(row.try_get("last_contacted")?)?,
        updated_at: parse_opt_ts(row.try_get("updated_at")?)?,
    })
}

fn leads_from_rows(rows: &[SqliteRow]) -> Result<Vec<Lead>, StorageError> {
    rows.iter().map(lead_from_row).collect()
}

const SELECT_RUN_STATE: &str = r#"
    SELECT state, last_transition_time, reason, controlled_by, last_heartbeat,
           error_message, current_task, discovery_query, discovery_location
    FROM agent_state WHERE id = 1
"#;

async fn apply_run_state_patch(
    conn: &mut SqliteConnection,
    patch: RunStatePatch,
) -> Result<AgentRunState, StorageError> {
    let mut next = match sqlx::query(SELECT_RUN_STATE)
        .fetch_optional(&mut *conn)
        .await?
    {
        Some(row) => run_state_from_row(&row)?,
        None => AgentRunState::default(),
    };
    patch.apply_to(&mut next);

    sqlx::query(
        r#"
        INSERT INTO agent_state (id, state, last_transition_time, reason, controlled_by,
            last_heartbeat, error_message, current_task, discovery_query, discovery_location)
        VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            last_transition_time = excluded.last_transition_time,
            reason = excluded.reason,
            controlled_by = excluded.controlled_by,
            last_heartbeat = excluded.last_heartbeat,
            error_message = excluded.error_message,
            current_task = excluded.current_task,
            discovery_query = excluded.discovery_query,
            discovery_location = excluded.discovery_location
        "#,
    )
    .bind(next.state.as_str())
    .bind(ts(next.last_transition_time))
    .bind(&next.reason)
    .bind(&next.controlled_by)
    .bind(next.last_heartbeat.map(ts))
    .bind(&next.error_message)
    .bind(&next.current_task)
    .bind(&next.discovery_query)
    .bind(&next.discovery_location)
    .execute(&mut *conn)
    .await?;

    Ok(next)
}

async fn insert_control_entry(
    conn: &mut SqliteConnection,
    entry: &ControlLogEntry,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO agent_control_log
            (timestamp, previous_state, new_state, controlled_by, reason, result)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(ts(entry.timestamp))
    .bind(entry.previous_state.as_str())
    .bind(entry.new_state.as_str())
    .bind(&entry.controlled_by)
    .bind(&entry.reason)
    .bind(entry.result.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_run_state(&self) -> Result<AgentRunState, StorageError> {
        let row = sqlx::query(SELECT_RUN_STATE)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => run_state_from_row(&row),
            None => Ok(AgentRunState::default()),
        }
    }

    async fn update_run_state(&self, patch: RunStatePatch) -> Result<AgentRunState, StorageError> {
        let mut tx = self.pool.begin().await?;
        let next = apply_run_state_patch(&mut tx, patch).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn commit_transition(
        &self,
        patch: RunStatePatch,
        entry: ControlLogEntry,
    ) -> Result<AgentRunState, StorageError> {
        let mut tx = self.pool.begin().await?;
        let next = apply_run_state_patch(&mut tx, patch).await?;
        insert_control_entry(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn append_control_log(&self, entry: ControlLogEntry) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        insert_control_entry(&mut conn, &entry).await
    }

    async fn control_logs(&self, limit: usize) -> Result<Vec<ControlLogEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, previous_state, new_state, controlled_by, reason, result
            FROM agent_control_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(control_entry_from_row).collect()
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO agent_logs (timestamp, module, lead_id, action, result, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(ts(entry.timestamp))
        .bind(&entry.module)
        .bind(&entry.lead_id)
        .bind(&entry.action)
        .bind(entry.result.as_str())
        .bind(serde_json::to_string(&entry.details)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_logs(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, module, lead_id, action, result, details
            FROM agent_logs
            WHERE (?1 IS NULL OR module = ?1)
              AND (?2 IS NULL OR lead_id = ?2)
            ORDER BY id DESC
            LIMIT ?3
            "#,
        )
        .bind(&query.module)
        .bind(&query.lead_id)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_entry_from_row).collect()
    }

    async fn insert_lead(&self, lead: Lead) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO leads (lead_id, business_name, category, location, website_url,
                email, lifecycle_state, review_status, outreach_status, discovered_at,
                last_contacted, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&lead.id)
        .bind(&lead.business_name)
        .bind(&lead.category)
        .bind(&lead.location)
        .bind(&lead.website_url)
        .bind(&lead.email)
        .bind(lead.lifecycle_state.map(|s| s.as_str()))
        .bind(lead.review_status.as_str())
        .bind(lead.outreach_status.as_str())
        .bind(ts(lead.discovered_at))
        .bind(lead.last_contacted.map(ts))
        .bind(lead.updated_at.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StorageError> {
        let row = sqlx::query("SELECT * FROM leads WHERE lead_id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn update_lead(&self, id: &str, patch: LeadPatch) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE leads SET
                lifecycle_state = COALESCE(?2, lifecycle_state),
                review_status = COALESCE(?3, review_status),
                outreach_status = COALESCE(?4, outreach_status),
                email = COALESCE(?5, email),
                last_contacted = COALESCE(?6, last_contacted),
                updated_at = ?7
            WHERE lead_id = ?1
            "#,
        )
        .bind(id)
        .bind(patch.lifecycle_state.map(|s| s.as_str()))
        .bind(patch.review_status.map(|s| s.as_str()))
        .bind(patch.outreach_status.map(|s| s.as_str()))
        .bind(&patch.email)
        .bind(patch.last_contacted.map(ts))
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, StorageError> {
        let rows = sqlx::query("SELECT * FROM leads ORDER BY discovered_at ASC")
            .fetch_all(&self.pool)
            .await?;
        leads_from_rows(&rows)
    }

    async fn leads_by_lifecycle_state(
        &self,
        state: LeadLifecycleState,
    ) -> Result<Vec<Lead>, StorageError> {
        // Legacy rows without a lifecycle column are resolved from review_status in Rust.
        let rows = sqlx::query(
            r#"
            SELECT * FROM leads
            WHERE lifecycle_state = ?1 OR lifecycle_state IS NULL OR lifecycle_state = ''
            ORDER BY discovered_at ASC
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(leads_from_rows(&rows)?
            .into_iter()
            .filter(|l| l.effective_lifecycle_state() == state)
            .collect())
    }

    async fn approved_leads_for_outreach(&self) -> Result<Vec<Lead>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM leads
            WHERE review_status = 'approved'
              AND outreach_status = 'not_sent'
              AND email IS NOT NULL AND TRIM(email) != ''
            ORDER BY discovered_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        leads_from_rows(&rows)
    }

    async fn leads_for_followup(
        &self,
        delay_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lead>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM leads
            WHERE review_status = 'approved'
              AND outreach_status = 'sent_initial'
            ORDER BY last_contacted ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(leads_from_rows(&rows)?
            .into_iter()
            .filter(|l| l.is_followup_due(delay_days, now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_state::{AgentState, ControlResult};
    use crate::leads::ReviewStatus;
    use crate::storage::FieldUpdate;
    use tempfile::TempDir;

    async fn open_temp(dir: &TempDir) -> SqliteStore {
        let url = format!("sqlite://{}", dir.path().join("leads.db").display());
        SqliteStore::open(&url, true).await.unwrap()
    }

    #[tokio::test]
    async fn test_run_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        assert_eq!(store.get_run_state().await.unwrap().state, AgentState::Idle);

        store
            .update_run_state(RunStatePatch {
                state: Some(AgentState::OutreachRunning),
                current_task: FieldUpdate::Set("Sending initial emails".to_string()),
                ..RunStatePatch::default()
            })
            .await
            .unwrap();

        let row = store.get_run_state().await.unwrap();
        assert_eq!(row.state, AgentState::OutreachRunning);
        assert_eq!(row.current_task.as_deref(), Some("Sending initial emails"));
    }

    #[tokio::test]
    async fn test_control_log_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        for (from, to) in [
            (AgentState::Idle, AgentState::Discovering),
            (AgentState::Discovering, AgentState::Idle),
        ] {
            store
                .append_control_log(ControlLogEntry {
                    timestamp: Utc::now(),
                    previous_state: from,
                    new_state: to,
                    controlled_by: "user".to_string(),
                    reason: None,
                    result: ControlResult::Success,
                })
                .await
                .unwrap();
        }

        let logs = store.control_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].new_state, AgentState::Idle);
    }

    #[tokio::test]
    async fn test_commit_transition_writes_row_and_log_together() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        let row = store
            .commit_transition(
                RunStatePatch {
                    state: Some(AgentState::Discovering),
                    discovery_query: FieldUpdate::Set("plumbers".to_string()),
                    ..RunStatePatch::default()
                },
                ControlLogEntry {
                    timestamp: Utc::now(),
                    previous_state: AgentState::Idle,
                    new_state: AgentState::Discovering,
                    controlled_by: "user".to_string(),
                    reason: Some("Discovery started: plumbers in Austin".to_string()),
                    result: ControlResult::Success,
                },
            )
            .await
            .unwrap();

        assert_eq!(row.state, AgentState::Discovering);
        assert_eq!(store.get_run_state().await.unwrap(), row);
        let logs = store.control_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].new_state, AgentState::Discovering);
    }

    #[tokio::test]
    async fn test_legacy_lead_resolves_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        store
            .insert_lead(
                Lead::discovered("Legacy Co")
                    .with_id("legacy")
                    .with_lifecycle_state(None)
                    .with_review_status(ReviewStatus::Approved),
            )
            .await
            .unwrap();

        let approved = store
            .leads_by_lifecycle_state(LeadLifecycleState::Approved)
            .await
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert!(store
            .leads_by_lifecycle_state(LeadLifecycleState::PendingReview)
            .await
            .unwrap()
            .is_empty());
    }
}
