//! Batch lifecycle persistence: one row per submitted batch, plus derived
//! checkpoints used to resume after a crash.

use chrono::Utc;
use rusqlite::{params, Row};
use std::path::{Path, PathBuf};

use super::{connect, parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::{Batch, BatchStatus, Checkpoint};

pub struct BatchRepository {
    db_path: PathBuf,
}

fn row_to_batch(row: &Row) -> rusqlite::Result<Batch> {
    let status_str: String = row.get("status")?;
    Ok(Batch {
        batch_id: row.get("batch_id")?,
        total_items: row.get::<_, i64>("total_items")? as u64,
        completed: row.get::<_, i64>("completed")? as u64,
        failed: row.get::<_, i64>("failed")? as u64,
        quarantined: row.get::<_, i64>("quarantined")? as u64,
        status: BatchStatus::from_str(&status_str).unwrap_or(BatchStatus::Pending),
        started_at: parse_datetime(&row.get::<_, String>("started_at")?),
        ended_at: parse_datetime_opt(row.get("ended_at")?),
    })
}

impl BatchRepository {
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
            CREATE TABLE IF NOT EXISTS batches (
                batch_id TEXT PRIMARY KEY,
                total_items INTEGER NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                quarantined INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                ended_at TEXT
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                batch_id TEXT PRIMARY KEY,
                last_contiguous_position INTEGER NOT NULL DEFAULT 0,
                last_processed_task_id TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                quarantined INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY(batch_id) REFERENCES batches(batch_id)
            );
            "#,
        )?;
        Ok(())
    }

    pub fn create(&self, batch_id: &str, total_items: u64) -> Result<Batch> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO batches (batch_id, total_items, status, started_at)
            VALUES (?1, ?2, 'pending', ?3)
            "#,
            params![batch_id, total_items as i64, now],
        )?;
        Ok(Batch {
            batch_id: batch_id.to_string(),
            total_items,
            completed: 0,
            failed: 0,
            quarantined: 0,
            status: BatchStatus::Pending,
            started_at: parse_datetime(&now),
            ended_at: None,
        })
    }

    pub fn get(&self, batch_id: &str) -> Result<Option<Batch>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM batches WHERE batch_id = ?1")?;
        to_option(stmt.query_row(params![batch_id], row_to_batch))
    }

    pub fn set_status(&self, batch_id: &str, status: BatchStatus) -> Result<()> {
        let conn = self.connect()?;
        let ended_at = status
            .is_terminal_status()
            .then(|| Utc::now().to_rfc3339());
        conn.execute(
            "UPDATE batches SET status = ?1, ended_at = COALESCE(?2, ended_at) WHERE batch_id = ?3",
            params![status.as_str(), ended_at, batch_id],
        )?;
        Ok(())
    }

    pub fn update_counts(&self, batch_id: &str, completed: u64, failed: u64, quarantined: u64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE batches SET completed = ?1, failed = ?2, quarantined = ?3 WHERE batch_id = ?4",
            params![completed as i64, failed as i64, quarantined as i64, batch_id],
        )?;
        Ok(())
    }

    /// Persist a cancellation request for `batch_id`, polled by
    /// `ConcurrencyEngine::run`'s claim loop so it reaches a batch being
    /// driven by a different process than the one calling this.
    pub fn request_cancel(&self, batch_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("UPDATE batches SET cancel_requested = 1 WHERE batch_id = ?1", params![batch_id])?;
        Ok(())
    }

    /// Clear a previously persisted cancellation request, so resuming a
    /// cancelled batch does not immediately cancel itself again.
    pub fn clear_cancel_request(&self, batch_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("UPDATE batches SET cancel_requested = 0 WHERE batch_id = ?1", params![batch_id])?;
        Ok(())
    }

    pub fn is_cancel_requested(&self, batch_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT cancel_requested FROM batches WHERE batch_id = ?1")?;
        let flag: Option<i64> = to_option(stmt.query_row(params![batch_id], |row| row.get(0)))?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Upsert the checkpoint row for a batch, used after each contiguous
    /// prefix advance so a crash can resume from `last_contiguous_position`.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO checkpoints (
                batch_id, last_contiguous_position, last_processed_task_id,
                completed, failed, quarantined, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(batch_id) DO UPDATE SET
                last_contiguous_position = excluded.last_contiguous_position,
                last_processed_task_id = excluded.last_processed_task_id,
                completed = excluded.completed,
                failed = excluded.failed,
                quarantined = excluded.quarantined,
                created_at = excluded.created_at
            "#,
            params![
                checkpoint.batch_id,
                checkpoint.last_contiguous_position as i64,
                checkpoint.last_processed_task_id,
                checkpoint.completed as i64,
                checkpoint.failed as i64,
                checkpoint.quarantined as i64,
                checkpoint.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self, batch_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM checkpoints WHERE batch_id = ?1")?;
        to_option(stmt.query_row(params![batch_id], |row| {
            Ok(Checkpoint {
                batch_id: row.get("batch_id")?,
                last_contiguous_position: row.get::<_, i64>("last_contiguous_position")? as u64,
                last_processed_task_id: row.get("last_processed_task_id")?,
                completed: row.get::<_, i64>("completed")? as u64,
                failed: row.get::<_, i64>("failed")? as u64,
                quarantined: row.get::<_, i64>("quarantined")? as u64,
                created_at: parse_datetime(&row.get::<_, String>("created_at")?),
            })
        }))
    }
}

impl BatchStatus {
    fn is_terminal_status(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_fetch_batch_round_trips() {
        let dir = tempdir().unwrap();
        let repo = BatchRepository::new(&dir.path().join("batches.db")).unwrap();
        repo.create("batch-1", 10).unwrap();

        let batch = repo.get("batch-1").unwrap().unwrap();
        assert_eq!(batch.total_items, 10);
        assert_eq!(batch.status, BatchStatus::Pending);
    }

    #[test]
    fn set_status_to_completed_stamps_ended_at() {
        let dir = tempdir().unwrap();
        let repo = BatchRepository::new(&dir.path().join("batches.db")).unwrap();
        repo.create("batch-1", 1).unwrap();
        repo.set_status("batch-1", BatchStatus::Completed).unwrap();

        let batch = repo.get("batch-1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.ended_at.is_some());
    }

    #[test]
    fn checkpoint_upsert_overwrites_previous() {
        let dir = tempdir().unwrap();
        let repo = BatchRepository::new(&dir.path().join("batches.db")).unwrap();
        repo.create("batch-1", 5).unwrap();

        let cp1 = Checkpoint {
            batch_id: "batch-1".to_string(),
            last_contiguous_position: 2,
            last_processed_task_id: Some("t1".to_string()),
            completed: 2,
            failed: 0,
            quarantined: 0,
            created_at: Utc::now(),
        };
        repo.save_checkpoint(&cp1).unwrap();

        let cp2 = Checkpoint {
            last_contiguous_position: 4,
            ..cp1
        };
        repo.save_checkpoint(&cp2).unwrap();

        let loaded = repo.load_checkpoint("batch-1").unwrap().unwrap();
        assert_eq!(loaded.last_contiguous_position, 4);
    }
}
