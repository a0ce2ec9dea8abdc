//! Persistence for per-service rate-limit accounting, mirroring the
//! per-domain backoff state table used by the crawl scrapers but keyed on a
//! logical service name (one row per LLM provider endpoint) instead of a URL
//! domain.

use chrono::Utc;
use rusqlite::{params, Row};
use std::path::{Path, PathBuf};

use super::{connect, parse_datetime, to_option, Result};
use crate::models::RateAccountingRecord;

pub struct RateAccountingRepository {
    db_path: PathBuf,
}

fn row_to_record(row: &Row) -> rusqlite::Result<RateAccountingRecord> {
    Ok(RateAccountingRecord {
        service: row.get("service")?,
        window_start: parse_datetime(&row.get::<_, String>("window_start")?),
        requests: row.get::<_, i64>("requests")? as u64,
        tokens: row.get::<_, i64>("tokens")? as u64,
    })
}

impl RateAccountingRepository {
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
            CREATE TABLE IF NOT EXISTS rate_accounting (
                service TEXT PRIMARY KEY,
                window_start TEXT NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                tokens INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Load the saved accounting window for a service, used on startup to
    /// continue a quota window across process restarts rather than granting
    /// a full fresh bucket.
    pub fn load(&self, service: &str) -> Result<Option<RateAccountingRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM rate_accounting WHERE service = ?1")?;
        to_option(stmt.query_row(params![service], row_to_record))
    }

    pub fn save(&self, record: &RateAccountingRecord) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO rate_accounting (service, window_start, requests, tokens, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(service) DO UPDATE SET
                window_start = excluded.window_start,
                requests = excluded.requests,
                tokens = excluded.tokens,
                updated_at = excluded.updated_at
            "#,
            params![
                record.service,
                record.window_start.to_rfc3339(),
                record.requests as i64,
                record.tokens as i64,
                now,
            ],
        )?;
        Ok(())
    }

    /// Drop accounting rows whose window has aged out, keeping the table
    /// from growing unbounded across long-running deployments.
    pub fn prune_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            "DELETE FROM rate_accounting WHERE window_start < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempdir().unwrap();
        let repo = RateAccountingRepository::new(&dir.path().join("rate.db")).unwrap();
        let record = RateAccountingRecord {
            service: "anthropic".to_string(),
            window_start: Utc::now(),
            requests: 12,
            tokens: 4096,
        };
        repo.save(&record).unwrap();

        let loaded = repo.load("anthropic").unwrap().unwrap();
        assert_eq!(loaded.requests, 12);
        assert_eq!(loaded.tokens, 4096);
    }

    #[test]
    fn load_missing_service_returns_none() {
        let dir = tempdir().unwrap();
        let repo = RateAccountingRepository::new(&dir.path().join("rate.db")).unwrap();
        assert!(repo.load("nonexistent").unwrap().is_none());
    }
}
