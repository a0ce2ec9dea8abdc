//! Repository layer for durable persistence (tasks, batches, checkpoints,
//! cache metadata, rate accounting, breaker state) backed by an embedded
//! SQLite database.

mod batch_repo;
mod breaker_repo;
mod cache_meta;
mod rate_accounting_repo;
mod task_queue;

pub use batch_repo::BatchRepository;
pub use breaker_repo::BreakerStateRepository;
pub use cache_meta::CacheMetaRepository;
pub use rate_accounting_repo::RateAccountingRepository;
pub use task_queue::TaskQueueRepository;

use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::PipelineError;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Convert a rusqlite Result<T> to Result<Option<T>>, treating
/// QueryReturnedNoRows as None.
pub fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Open a connection with pragmas tuned for a single-file, multi-reader /
/// single-writer workload under concurrent async workers.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        PRAGMA cache_size = -64000;
        PRAGMA temp_store = MEMORY;
        "#,
    )?;
    Ok(conn)
}

/// Execute a database operation with retry logic for lock errors. Retries up
/// to 5 times with exponential backoff (100ms, 200ms, 400ms, 800ms, 1600ms).
pub fn with_retry<T, F>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_retries = 5;
    let mut delay_ms = 100;

    for attempt in 0..max_retries {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                let is_lock_error = e.message.contains("database is locked")
                    || e.message.contains("SQLITE_BUSY")
                    || e.message.contains("SQLITE_LOCKED");

                if is_lock_error && attempt < max_retries - 1 {
                    tracing::debug!(
                        "database locked, retrying in {}ms (attempt {}/{})",
                        delay_ms,
                        attempt + 1,
                        max_retries
                    );
                    thread::sleep(Duration::from_millis(delay_ms));
                    delay_ms *= 2;
                    continue;
                }
                return Err(e);
            }
        }
    }

    operation()
}
