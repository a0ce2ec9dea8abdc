//! Durable task queue: tasks table with atomic claim/advance operations.

use chrono::Utc;
use rusqlite::{params, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{connect, parse_datetime, parse_datetime_opt, to_option, Result};
use crate::error::{ErrorKind, PipelineError};
use crate::models::{Stage, Task, TaskState, VocabularyItem};

/// SQLite-backed repository for the task state machine: atomic claim and
/// advance of one item's progress through Stage 1 and Stage 2.
pub struct TaskQueueRepository {
    db_path: PathBuf,
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let state_str: String = row.get("state")?;
    let state = TaskState::from_str(&state_str).unwrap_or(TaskState::Pending);
    let last_error_kind: Option<String> = row.get("last_error_kind")?;

    Ok(Task {
        task_id: row.get("task_id")?,
        batch_id: row.get("batch_id")?,
        position: row.get::<_, i64>("position")? as u64,
        term: row.get("term")?,
        type_hint: row.get("type_hint")?,
        state,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        last_error: row.get("last_error")?,
        last_error_kind: last_error_kind.map(|k| kind_from_str(&k)),
        stage1_fingerprint: row.get("stage1_fingerprint")?,
        stage2_fingerprint: row.get("stage2_fingerprint")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
        claim_token: row.get("claim_token")?,
        claimed_at: parse_datetime_opt(row.get("claimed_at")?),
    })
}

fn kind_from_str(s: &str) -> ErrorKind {
    match s {
        "network" => ErrorKind::Network,
        "timeout" => ErrorKind::Timeout,
        "rate_limited" => ErrorKind::RateLimited { retry_after: None },
        "breaker_open" => ErrorKind::BreakerOpen,
        "server_error" => ErrorKind::ServerError { status: 0 },
        "auth_error" => ErrorKind::AuthError,
        "quota_exhausted" => ErrorKind::QuotaExhausted,
        "invalid_response" => ErrorKind::InvalidResponse,
        "schema_validation" => ErrorKind::SchemaValidation,
        "persistence_error" => ErrorKind::PersistenceError,
        "cancelled" => ErrorKind::Cancelled,
        _ => ErrorKind::Internal,
    }
}

impl TaskQueueRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                term TEXT NOT NULL,
                type_hint TEXT,
                state TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_error_kind TEXT,
                stage1_fingerprint TEXT,
                stage2_fingerprint TEXT,
                claim_token TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(batch_id, position)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_batch_state ON tasks(batch_id, state);
            CREATE INDEX IF NOT EXISTS idx_tasks_batch_position ON tasks(batch_id, position);
            "#,
        )?;
        Ok(())
    }

    /// Atomic batch insert: all positions visible or none.
    pub fn enqueue(&self, batch_id: &str, items: &[VocabularyItem]) -> Result<Vec<Task>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut tasks = Vec::with_capacity(items.len());

        for item in items {
            let task_id = Uuid::new_v4().to_string();
            tx.execute(
                r#"
                INSERT INTO tasks (
                    task_id, batch_id, position, term, type_hint, state,
                    retry_count, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)
                "#,
                params![
                    task_id,
                    batch_id,
                    item.position as i64,
                    item.term,
                    item.type_hint,
                    now,
                ],
            )?;
            tasks.push(Task::new(
                task_id,
                batch_id.to_string(),
                item.position,
                item.term.clone(),
                item.type_hint.clone(),
            ));
        }

        tx.commit()?;
        Ok(tasks)
    }

    /// Atomically move up to `n` Pending tasks into Processing(Stage1),
    /// stamping a fresh claim token so a crashed worker can later be
    /// detected (a task Processing longer than T with no heartbeat is
    /// reclaimable via `reclaim_stale`).
    pub fn claim(&self, batch_id: &str, n: u32) -> Result<Vec<Task>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let task_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT task_id FROM tasks
                WHERE batch_id = ?1 AND state = 'pending'
                ORDER BY position ASC
                LIMIT ?2
                "#,
            )?;
            stmt.query_map(params![batch_id, n], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        for task_id in &task_ids {
            let claim_token = Uuid::new_v4().to_string();
            tx.execute(
                r#"
                UPDATE tasks SET state = 'processing_stage1', claim_token = ?1,
                    claimed_at = ?2, updated_at = ?2
                WHERE task_id = ?3
                "#,
                params![claim_token, now, task_id],
            )?;
        }

        let mut claimed = Vec::with_capacity(task_ids.len());
        for task_id in &task_ids {
            let mut stmt = tx.prepare("SELECT * FROM tasks WHERE task_id = ?1")?;
            let task = stmt.query_row(params![task_id], row_to_task)?;
            claimed.push(task);
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Reclaim tasks stuck in a Processing state whose claim is older than
    /// `stale_after`, returning them to Pending so another worker can pick
    /// them up. Used after a crash detection heartbeat check.
    pub fn reclaim_stale(&self, batch_id: &str, stale_after: chrono::Duration) -> Result<u64> {
        let conn = self.connect()?;
        let cutoff = (Utc::now() - stale_after).to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            r#"
            UPDATE tasks SET state = 'pending', claim_token = NULL, claimed_at = NULL, updated_at = ?1
            WHERE batch_id = ?2
              AND state IN ('processing_stage1', 'processing_stage2')
              AND claimed_at IS NOT NULL
              AND claimed_at < ?3
            "#,
            params![now, batch_id, cutoff],
        )?;
        Ok(updated as u64)
    }

    /// Transition a task, updating retry_count/last_error as applicable.
    #[allow(clippy::too_many_arguments)]
    pub fn advance(
        &self,
        task_id: &str,
        new_state: TaskState,
        last_error: Option<&PipelineError>,
        stage1_fingerprint: Option<&str>,
        stage2_fingerprint: Option<&str>,
        increment_retry: bool,
    ) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();

        let (error_msg, error_kind) = match last_error {
            Some(e) => (Some(e.message.clone()), Some(e.kind.as_str().to_string())),
            None => (None, None),
        };

        conn.execute(
            r#"
            UPDATE tasks SET
                state = ?1,
                last_error = COALESCE(?2, last_error),
                last_error_kind = COALESCE(?3, last_error_kind),
                stage1_fingerprint = COALESCE(?4, stage1_fingerprint),
                stage2_fingerprint = COALESCE(?5, stage2_fingerprint),
                retry_count = retry_count + ?6,
                claim_token = CASE WHEN ?1 IN ('completed', 'quarantined', 'pending') THEN NULL ELSE claim_token END,
                claimed_at = CASE WHEN ?1 IN ('completed', 'quarantined', 'pending') THEN NULL ELSE claimed_at END,
                updated_at = ?7
            WHERE task_id = ?8
            "#,
            params![
                new_state.as_str(),
                error_msg,
                error_kind,
                stage1_fingerprint,
                stage2_fingerprint,
                if increment_retry { 1 } else { 0 },
                now,
                task_id,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE task_id = ?1")?;
        to_option(stmt.query_row(params![task_id], row_to_task))
    }

    pub fn list_by_batch(&self, batch_id: &str) -> Result<Vec<Task>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE batch_id = ?1 ORDER BY position ASC")?;
        let tasks = stmt
            .query_map(params![batch_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Tasks not yet in a terminal state, used by `resume_batch` to rebuild
    /// the pending set.
    pub fn list_non_terminal(&self, batch_id: &str) -> Result<Vec<Task>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE batch_id = ?1 AND state NOT IN ('completed', 'quarantined') ORDER BY position ASC",
        )?;
        let tasks = stmt
            .query_map(params![batch_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn quarantined(&self, batch_id: &str) -> Result<Vec<Task>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE batch_id = ?1 AND state = 'quarantined' ORDER BY position ASC")?;
        let tasks = stmt
            .query_map(params![batch_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Counts per terminal/near-terminal state, used to build checkpoints
    /// and batch reports without reconstructing state in memory.
    pub fn counts_by_state(&self, batch_id: &str) -> Result<std::collections::HashMap<String, u64>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM tasks WHERE batch_id = ?1 GROUP BY state",
        )?;
        let rows = stmt.query_map(params![batch_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = std::collections::HashMap::new();
        for row in rows {
            let (state, count) = row?;
            counts.insert(state, count);
        }
        Ok(counts)
    }

    /// Mark `Stage(Stage2)` as the next processing stage once Stage 1 has
    /// completed, without altering retry bookkeeping.
    pub fn mark_completed_stage1(&self, task_id: &str, stage1_fingerprint: &str) -> Result<()> {
        self.advance(
            task_id,
            TaskState::CompletedStage1,
            None,
            Some(stage1_fingerprint),
            None,
            false,
        )
    }

    pub fn mark_processing(&self, task_id: &str, stage: Stage) -> Result<()> {
        let state = TaskState::Processing(stage);
        self.advance(task_id, state, None, None, None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn items(n: u64) -> Vec<VocabularyItem> {
        (1..=n)
            .map(|p| VocabularyItem::new(p, format!("term-{p}"), None))
            .collect()
    }

    #[test]
    fn enqueue_and_claim_respects_position_order() {
        let dir = tempdir().unwrap();
        let repo = TaskQueueRepository::new(&dir.path().join("queue.db")).unwrap();

        repo.enqueue("batch-1", &items(3)).unwrap();
        let claimed = repo.claim("batch-1", 2).unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].position, 1);
        assert_eq!(claimed[1].position, 2);
        assert_eq!(claimed[0].state, TaskState::Processing(Stage::Stage1));
    }

    #[test]
    fn advance_to_quarantined_stops_further_claims() {
        let dir = tempdir().unwrap();
        let repo = TaskQueueRepository::new(&dir.path().join("queue.db")).unwrap();
        let tasks = repo.enqueue("batch-1", &items(1)).unwrap();
        let task_id = &tasks[0].task_id;

        repo.advance(task_id, TaskState::Quarantined, None, None, None, true)
            .unwrap();
        let task = repo.get(task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Quarantined);
        assert_eq!(task.retry_count, 1);

        let claimed = repo.claim("batch-1", 10).unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn reclaim_stale_returns_processing_tasks_to_pending() {
        let dir = tempdir().unwrap();
        let repo = TaskQueueRepository::new(&dir.path().join("queue.db")).unwrap();
        repo.enqueue("batch-1", &items(1)).unwrap();
        let claimed = repo.claim("batch-1", 1).unwrap();
        assert_eq!(claimed.len(), 1);

        // Immediately "stale" with a zero-duration cutoff.
        let reclaimed = repo.reclaim_stale("batch-1", chrono::Duration::seconds(-1)).unwrap();
        assert_eq!(reclaimed, 1);

        let task = repo.get(&claimed[0].task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
    }
}
