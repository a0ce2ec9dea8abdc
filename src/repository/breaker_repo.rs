//! Persistence for circuit breaker state, so an Open breaker survives a
//! process restart instead of resetting to Closed and re-hammering a
//! service that tripped it.

use chrono::Utc;
use rusqlite::{params, Row};
use std::path::{Path, PathBuf};

use super::{connect, parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::{BreakerState, BreakerStateRecord};

pub struct BreakerStateRepository {
    db_path: PathBuf,
}

fn row_to_record(row: &Row) -> rusqlite::Result<BreakerStateRecord> {
    let state_str: String = row.get("state")?;
    Ok(BreakerStateRecord {
        service: row.get("service")?,
        state: BreakerState::from_str(&state_str).unwrap_or(BreakerState::Closed),
        window_start: parse_datetime(&row.get::<_, String>("window_start")?),
        failures: row.get::<_, i64>("failures")? as u32,
        successes: row.get::<_, i64>("successes")? as u32,
        opened_at: parse_datetime_opt(row.get("opened_at")?),
    })
}

impl BreakerStateRepository {
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
            CREATE TABLE IF NOT EXISTS breaker_state (
                service TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'closed',
                window_start TEXT NOT NULL,
                failures INTEGER NOT NULL DEFAULT 0,
                successes INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn load(&self, service: &str) -> Result<Option<BreakerStateRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM breaker_state WHERE service = ?1")?;
        to_option(stmt.query_row(params![service], row_to_record))
    }

    pub fn load_all(&self) -> Result<Vec<BreakerStateRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM breaker_state")?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn save(&self, record: &BreakerStateRecord) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO breaker_state (service, state, window_start, failures, successes, opened_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(service) DO UPDATE SET
                state = excluded.state,
                window_start = excluded.window_start,
                failures = excluded.failures,
                successes = excluded.successes,
                opened_at = excluded.opened_at,
                updated_at = excluded.updated_at
            "#,
            params![
                record.service,
                record.state.as_str(),
                record.window_start.to_rfc3339(),
                record.failures as i64,
                record.successes as i64,
                record.opened_at.map(|t| t.to_rfc3339()),
                now,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_open_breaker_round_trips() {
        let dir = tempdir().unwrap();
        let repo = BreakerStateRepository::new(&dir.path().join("breaker.db")).unwrap();
        let record = BreakerStateRecord {
            service: "openai".to_string(),
            state: BreakerState::Open,
            window_start: Utc::now(),
            failures: 5,
            successes: 0,
            opened_at: Some(Utc::now()),
        };
        repo.save(&record).unwrap();

        let loaded = repo.load("openai").unwrap().unwrap();
        assert_eq!(loaded.state, BreakerState::Open);
        assert_eq!(loaded.failures, 5);
        assert!(loaded.opened_at.is_some());
    }

    #[test]
    fn load_all_returns_every_service() {
        let dir = tempdir().unwrap();
        let repo = BreakerStateRepository::new(&dir.path().join("breaker.db")).unwrap();
        repo.save(&BreakerStateRecord {
            service: "a".to_string(),
            state: BreakerState::Closed,
            window_start: Utc::now(),
            failures: 0,
            successes: 3,
            opened_at: None,
        })
        .unwrap();
        repo.save(&BreakerStateRecord {
            service: "b".to_string(),
            state: BreakerState::HalfOpen,
            window_start: Utc::now(),
            failures: 1,
            successes: 0,
            opened_at: None,
        })
        .unwrap();

        let all = repo.load_all().unwrap();
        assert_eq!(all.len(), 2);
    }
}
