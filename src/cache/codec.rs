//! Payload compression codecs for cache entries.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::PipelineError;
use crate::models::CacheCodec;

pub fn compress(codec: CacheCodec, data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    match codec {
        CacheCodec::None => Ok(data.to_vec()),
        CacheCodec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CacheCodec::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder
                .write_all(data)
                .map_err(|e| PipelineError::internal(format!("gzip compress: {e}")))?;
            encoder
                .finish()
                .map_err(|e| PipelineError::internal(format!("gzip compress: {e}")))
        }
    }
}

pub fn decompress(codec: CacheCodec, data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    match codec {
        CacheCodec::None => Ok(data.to_vec()),
        CacheCodec::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| PipelineError::internal(format!("lz4 decompress: {e}"))),
        CacheCodec::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| PipelineError::internal(format!("gzip decompress: {e}")))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_codec_is_identity() {
        let data = b"some payload bytes";
        let compressed = compress(CacheCodec::None, data).unwrap();
        assert_eq!(compressed, data);
        assert_eq!(decompress(CacheCodec::None, &compressed).unwrap(), data);
    }

    #[test]
    fn lz4_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog, repeated, repeated, repeated";
        let compressed = compress(CacheCodec::Lz4, data).unwrap();
        assert_eq!(decompress(CacheCodec::Lz4, &compressed).unwrap(), data);
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog, repeated, repeated, repeated";
        let compressed = compress(CacheCodec::Gzip, data).unwrap();
        assert_eq!(decompress(CacheCodec::Gzip, &compressed).unwrap(), data);
    }
}
