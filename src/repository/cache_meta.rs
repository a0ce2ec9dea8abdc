//! Cache metadata persistence and compressed blob storage.
//!
//! Entry payloads are stored on disk under a two-level hash-prefix directory
//! layout (the same scheme used for document content: `{dir}/{fp[0..2]}/{fp}.bin`),
//! with row metadata (codec, sizes, access stats) kept in SQLite for fast
//! `stats()` aggregation and LRU/hot-entry eviction decisions.

use chrono::Utc;
use rusqlite::{params, Row};
use std::path::{Path, PathBuf};

use super::{connect, parse_datetime, to_option, Result};
use crate::error::PipelineError;
use crate::models::{CacheCodec, CacheEntryMeta, CacheStage, CacheStats};

pub struct CacheMetaRepository {
    db_path: PathBuf,
    blobs_dir: PathBuf,
}

fn row_to_meta(row: &Row) -> rusqlite::Result<CacheEntryMeta> {
    let codec_str: String = row.get("codec")?;
    let stage_i32: i32 = row.get("stage")?;
    Ok(CacheEntryMeta {
        fingerprint: row.get("fingerprint")?,
        stage: CacheStage::from_i32(stage_i32).unwrap_or(CacheStage::Stage1),
        codec: CacheCodec::from_str(&codec_str).unwrap_or(CacheCodec::None),
        uncompressed_size: row.get::<_, i64>("uncompressed_size")? as u64,
        compressed_size: row.get::<_, i64>("compressed_size")? as u64,
        tokens: row.get::<_, i64>("tokens")? as u64,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        accessed_at: parse_datetime(&row.get::<_, String>("accessed_at")?),
        access_count: row.get::<_, i64>("access_count")? as u64,
        hot: row.get::<_, i64>("hot")? != 0,
    })
}

/// Two-level hash-prefix blob path: `{dir}/{fingerprint[0..2]}/{fingerprint}.bin`.
pub fn blob_path(blobs_dir: &Path, fingerprint: &str) -> PathBuf {
    blobs_dir.join(&fingerprint[..2]).join(format!("{fingerprint}.bin"))
}

impl CacheMetaRepository {
    pub fn new(db_path: &Path, blobs_dir: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
            blobs_dir: blobs_dir.to_path_buf(),
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
            CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT PRIMARY KEY,
                stage INTEGER NOT NULL,
                codec TEXT NOT NULL,
                uncompressed_size INTEGER NOT NULL,
                compressed_size INTEGER NOT NULL,
                tokens INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                accessed_at TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                hot INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_cache_accessed ON cache_entries(accessed_at);
            CREATE INDEX IF NOT EXISTS idx_cache_hot ON cache_entries(hot);
            "#,
        )?;
        Ok(())
    }

    /// Write the compressed payload to disk and insert its metadata row.
    /// Callers pass the already-encoded bytes (post-codec); this repository
    /// only concerns itself with placement and bookkeeping.
    pub fn put(&self, fingerprint: &str, stage: CacheStage, codec: CacheCodec, uncompressed_size: u64, payload: &[u8], tokens: u64) -> Result<()> {
        let path = blob_path(&self.blobs_dir, fingerprint);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::persistence(format!("creating cache blob dir: {e}")))?;
        }
        std::fs::write(&path, payload)
            .map_err(|e| PipelineError::persistence(format!("writing cache blob: {e}")))?;

        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO cache_entries (
                fingerprint, stage, codec, uncompressed_size, compressed_size,
                tokens, created_at, accessed_at, access_count, hot
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, 0)
            ON CONFLICT(fingerprint) DO UPDATE SET
                stage = excluded.stage,
                codec = excluded.codec,
                uncompressed_size = excluded.uncompressed_size,
                compressed_size = excluded.compressed_size,
                tokens = excluded.tokens,
                accessed_at = excluded.accessed_at
            "#,
            params![
                fingerprint,
                stage.as_i32(),
                codec.as_str(),
                uncompressed_size as i64,
                payload.len() as i64,
                tokens as i64,
                now,
            ],
        )?;
        Ok(())
    }

    /// Fetch the payload bytes and bump access bookkeeping. Returns `None`
    /// on a cache miss (no metadata row, or the blob file is missing).
    pub fn get(&self, fingerprint: &str) -> Result<Option<(CacheEntryMeta, Vec<u8>)>> {
        let meta = match self.get_meta(fingerprint)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let path = blob_path(&self.blobs_dir, fingerprint);
        let payload = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::persistence(format!("reading cache blob: {e}"))),
        };

        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE cache_entries SET accessed_at = ?1, access_count = access_count + 1 WHERE fingerprint = ?2",
            params![now, fingerprint],
        )?;

        Ok(Some((meta, payload)))
    }

    pub fn get_meta(&self, fingerprint: &str) -> Result<Option<CacheEntryMeta>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM cache_entries WHERE fingerprint = ?1")?;
        to_option(stmt.query_row(params![fingerprint], row_to_meta))
    }

    pub fn mark_hot(&self, fingerprint: &str, hot: bool) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE cache_entries SET hot = ?1 WHERE fingerprint = ?2",
            params![hot as i64, fingerprint],
        )?;
        Ok(())
    }

    pub fn invalidate(&self, fingerprint: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM cache_entries WHERE fingerprint = ?1", params![fingerprint])?;
        let path = blob_path(&self.blobs_dir, fingerprint);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| PipelineError::persistence(format!("removing cache blob: {e}")))?;
        }
        Ok(())
    }

    /// Entries eligible for eviction: not marked `hot`, oldest `accessed_at`
    /// first. The cache store decides how many to evict to respect its size
    /// budget; this repository just supplies the ordering.
    pub fn least_recently_used(&self, limit: u64) -> Result<Vec<CacheEntryMeta>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM cache_entries WHERE hot = 0 ORDER BY accessed_at ASC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], row_to_meta)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// All metadata rows, used by `invalidate(predicate)` to decide which
    /// entries to drop without loading payloads.
    pub fn list_all(&self) -> Result<Vec<CacheEntryMeta>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM cache_entries")?;
        let entries = stmt
            .query_map([], row_to_meta)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.connect()?;
        let (entries, bytes, hot_entries): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(compressed_size), 0), COALESCE(SUM(hot), 0) FROM cache_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CacheStats {
            entries: entries as u64,
            bytes: bytes as u64,
            hits: 0,
            misses: 0,
            hot_entries: hot_entries as u64,
            tokens_saved: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn repo(dir: &std::path::Path) -> CacheMetaRepository {
        CacheMetaRepository::new(&dir.join("cache.db"), &dir.join("blobs")).unwrap()
    }

    #[test]
    fn put_then_get_round_trips_payload() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let fp = "abcd1234abcd1234abcd1234abcd1234";
        repo.put(fp, CacheStage::Stage1, CacheCodec::Lz4, 100, b"compressed-bytes", 42).unwrap();

        let (meta, payload) = repo.get(fp).unwrap().unwrap();
        assert_eq!(payload, b"compressed-bytes");
        assert_eq!(meta.tokens, 42);
        assert_eq!(meta.access_count, 0);

        let (meta_again, _) = repo.get(fp).unwrap().unwrap();
        assert_eq!(meta_again.access_count, 1);
    }

    #[test]
    fn get_missing_fingerprint_is_none() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        assert!(repo.get("0000000000000000000000000000000000").unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_row_and_blob() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let fp = "ffff0000ffff0000ffff0000ffff0000";
        repo.put(fp, CacheStage::Stage2, CacheCodec::None, 10, b"hello", 1).unwrap();
        repo.invalidate(fp).unwrap();
        assert!(repo.get(fp).unwrap().is_none());
        assert!(!blob_path(&dir.path().join("blobs"), fp).exists());
    }

    #[test]
    fn least_recently_used_skips_hot_entries() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        repo.put("aa00aa00aa00aa00aa00aa00aa00aa00", CacheStage::Stage1, CacheCodec::None, 1, b"a", 1).unwrap();
        repo.put("bb00bb00bb00bb00bb00bb00bb00bb00", CacheStage::Stage1, CacheCodec::None, 1, b"b", 1).unwrap();
        repo.mark_hot("aa00aa00aa00aa00aa00aa00aa00aa00", true).unwrap();

        let lru = repo.least_recently_used(10).unwrap();
        assert_eq!(lru.len(), 1);
        assert_eq!(lru[0].fingerprint, "bb00bb00bb00bb00bb00bb00bb00bb00");
    }
}
