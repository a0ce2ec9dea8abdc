//! Cache entry metadata, codec, and aggregate cache statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCodec {
    None,
    Lz4,
    Gzip,
}

impl CacheCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCodec::None => "none",
            CacheCodec::Lz4 => "lz4",
            CacheCodec::Gzip => "gzip",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "none" => CacheCodec::None,
            "lz4" => CacheCodec::Lz4,
            "gzip" => CacheCodec::Gzip,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStage {
    Stage1,
    Stage2,
}

impl CacheStage {
    pub fn as_i32(&self) -> i32 {
        match self {
            CacheStage::Stage1 => 1,
            CacheStage::Stage2 => 2,
        }
    }

    pub fn from_i32(n: i32) -> Option<Self> {
        match n {
            1 => Some(CacheStage::Stage1),
            2 => Some(CacheStage::Stage2),
            _ => None,
        }
    }
}

/// Metadata row for one cache entry. The payload itself lives either inline
/// in this struct (small artifacts) or as an external compressed blob file
/// referenced by fingerprint, mirroring the two-level hash-prefix directory
/// layout used for document content on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub fingerprint: String,
    pub stage: CacheStage,
    pub codec: CacheCodec,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub tokens: u64,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub hot: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hot_entries: u64,
    pub tokens_saved: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
