//! Content-addressed cache for Stage 1 / Stage 2 artifacts.
//!
//! Backed by [`CacheMetaRepository`] for durable metadata + blob storage and
//! fronted by a bounded in-memory LRU layer with a "hot" carve-out. Concurrent
//! misses for the same fingerprint are collapsed via a single-flight guard so
//! only one caller computes and inserts.

pub mod codec;
pub mod fingerprint;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};

use crate::error::PipelineError;
use crate::models::{CacheCodec, CacheStage, CacheStats};
use crate::repository::CacheMetaRepository;

type InflightSlot = Arc<OnceCell<Result<(Vec<u8>, u64), PipelineError>>>;

pub struct CacheStore {
    repo: Arc<CacheMetaRepository>,
    codec: CacheCodec,
    hot_threshold: u64,
    memory: Mutex<LruCache<String, Arc<(Vec<u8>, u64)>>>,
    inflight: Mutex<HashMap<String, InflightSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    tokens_saved: AtomicU64,
}

impl CacheStore {
    pub fn new(repo: Arc<CacheMetaRepository>, codec: CacheCodec, hot_threshold: u64, memory_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(memory_capacity.max(1)).expect("memory_capacity > 0");
        Self {
            repo,
            codec,
            hot_threshold,
            memory: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
        }
    }

    /// `get(stage, fingerprint) -> (artifact, tokens_saved) | miss`.
    pub async fn get<T>(&self, stage: CacheStage, fingerprint: &str) -> Result<Option<(T, u64)>, PipelineError>
    where
        T: DeserializeOwned,
    {
        if let Some(entry) = self.memory.lock().await.get(fingerprint).cloned() {
            let (bytes, tokens) = entry.as_ref();
            match serde_json::from_slice::<T>(bytes) {
                Ok(value) => return Ok(Some((value, *tokens))),
                Err(_) => {
                    // Fall through to the durable layer; memory corruption
                    // of this kind should not happen but is not fatal.
                }
            }
        }

        let Some((meta, compressed)) = self.repo.get(fingerprint)? else {
            return Ok(None);
        };

        let bytes = match codec::decompress(meta.codec, &compressed) {
            Ok(bytes) => bytes,
            Err(_) => {
                tracing::warn!(fingerprint, "corrupt cache payload, evicting");
                self.repo.invalidate(fingerprint)?;
                return Ok(None);
            }
        };

        let value = match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(fingerprint, "undecodable cache payload, evicting");
                self.repo.invalidate(fingerprint)?;
                return Ok(None);
            }
        };

        if meta.access_count + 1 >= self.hot_threshold {
            self.repo.mark_hot(fingerprint, true)?;
        }

        self.memory
            .lock()
            .await
            .put(fingerprint.to_string(), Arc::new((bytes, meta.tokens)));

        let _ = stage;
        Ok(Some((value, meta.tokens)))
    }

    /// `put(stage, fingerprint, artifact, tokens)`.
    pub async fn put<T>(&self, stage: CacheStage, fingerprint: &str, value: &T, tokens: u64) -> Result<(), PipelineError>
    where
        T: Serialize,
    {
        let bytes = serde_json::to_vec(value)?;
        let compressed = codec::compress(self.codec, &bytes)?;

        if let Err(e) = self
            .repo
            .put(fingerprint, stage, self.codec, bytes.len() as u64, &compressed, tokens)
        {
            tracing::warn!(fingerprint, error = %e, "cache write failed, continuing without it");
            return Ok(());
        }

        self.memory
            .lock()
            .await
            .put(fingerprint.to_string(), Arc::new((bytes, tokens)));
        Ok(())
    }

    /// Single-flight get-or-compute: a cache hit short-circuits; a miss is
    /// computed by exactly one caller per fingerprint, with other
    /// concurrent callers waiting on the same slot and then reading the
    /// result it produced.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        stage: CacheStage,
        fingerprint: &str,
        compute: F,
    ) -> Result<(T, u64, bool), PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(T, u64), PipelineError>>,
    {
        if let Some((value, tokens)) = self.get::<T>(stage, fingerprint).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.tokens_saved.fetch_add(tokens, Ordering::Relaxed);
            return Ok((value, tokens, true));
        }

        let slot = self.acquire_inflight_slot(fingerprint).await;

        let result = slot
            .get_or_try_init(|| async {
                if let Some((bytes, tokens)) = self.get_raw(fingerprint).await? {
                    return Ok((bytes, tokens));
                }
                let (value, tokens) = compute().await?;
                self.put(stage, fingerprint, &value, tokens).await?;
                let bytes = serde_json::to_vec(&value)?;
                Ok((bytes, tokens))
            })
            .await
            .cloned();

        self.release_inflight_slot(fingerprint).await;

        let (bytes, tokens) = result?;
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = serde_json::from_slice::<T>(&bytes)?;
        Ok((value, tokens, false))
    }

    async fn get_raw(&self, fingerprint: &str) -> Result<Option<(Vec<u8>, u64)>, PipelineError> {
        if let Some(entry) = self.memory.lock().await.get(fingerprint).cloned() {
            return Ok(Some(entry.as_ref().clone()));
        }
        let Some((meta, compressed)) = self.repo.get(fingerprint)? else {
            return Ok(None);
        };
        let bytes = codec::decompress(meta.codec, &compressed)?;
        Ok(Some((bytes, meta.tokens)))
    }

    async fn acquire_inflight_slot(&self, fingerprint: &str) -> InflightSlot {
        self.inflight
            .lock()
            .await
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn release_inflight_slot(&self, fingerprint: &str) {
        self.inflight.lock().await.remove(fingerprint);
    }

    /// `invalidate(predicate)`: remove entries matching a predicate (by
    /// fingerprint, age, size, or stage).
    pub fn invalidate<P>(&self, predicate: P) -> Result<u64, PipelineError>
    where
        P: Fn(&crate::models::CacheEntryMeta) -> bool,
    {
        let mut removed = 0;
        for meta in self.repo.list_all()? {
            if predicate(&meta) {
                self.repo.invalidate(&meta.fingerprint)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// `stats() -> {entries, bytes, hit_rate, hot_entries, tokens_saved}`.
    pub fn stats(&self) -> Result<CacheStats, PipelineError> {
        let mut stats = self.repo.stats()?;
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.tokens_saved = self.tokens_saved.load(Ordering::Relaxed);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    struct Dummy {
        value: String,
    }

    fn store(dir: &std::path::Path) -> CacheStore {
        let repo = Arc::new(CacheMetaRepository::new(&dir.join("cache.db"), &dir.join("blobs")).unwrap());
        CacheStore::new(repo, CacheCodec::Lz4, 3, 16)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_artifact_and_tokens() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let value = Dummy { value: "hello".to_string() };
        store.put(CacheStage::Stage1, "fp1", &value, 42).await.unwrap();

        let (got, tokens) = store.get::<Dummy>(CacheStage::Stage1, "fp1").await.unwrap().unwrap();
        assert_eq!(got, value);
        assert_eq!(tokens, 42);
    }

    #[tokio::test]
    async fn get_missing_fingerprint_is_miss() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.get::<Dummy>(CacheStage::Stage1, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_or_compute_invokes_compute_exactly_once_for_concurrent_miss() {
        let dir = tempdir().unwrap();
        let store = Arc::new(store(dir.path()));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_compute(CacheStage::Stage1, "shared-fp", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                            Ok::<_, PipelineError>((Dummy { value: "computed".to_string() }, 7))
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for (value, tokens, _) in &results {
            assert_eq!(value.value, "computed");
            assert_eq!(*tokens, 7);
        }
    }

    #[tokio::test]
    async fn invalidate_removes_matching_entries() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .put(CacheStage::Stage1, "keep", &Dummy { value: "a".to_string() }, 1)
            .await
            .unwrap();
        store
            .put(CacheStage::Stage2, "drop", &Dummy { value: "b".to_string() }, 1)
            .await
            .unwrap();

        let removed = store.invalidate(|meta| meta.stage == CacheStage::Stage2).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get::<Dummy>(CacheStage::Stage2, "drop").await.unwrap().is_none());
        assert!(store.get::<Dummy>(CacheStage::Stage1, "keep").await.unwrap().is_some());
    }
}
