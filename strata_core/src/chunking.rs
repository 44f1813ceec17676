//! Content-defined chunking using FastCDC.

use crate::error::{Error, Result};
use crate::id::Id;
use fastcdc::v2020::StreamCDC;
use std::io::Read;

/// Configuration for the chunker.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes.
    pub min_size: u32,
    /// Average (target) chunk size in bytes.
    pub avg_size: u32,
    /// Maximum chunk size in bytes.
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 256 * 1024,  // 256 KB
            avg_size: 512 * 1024,  // 512 KB
            max_size: 1024 * 1024, // 1 MB
        }
    }
}

/// One content-defined piece of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Id of `data`.
    pub id: Id,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

/// Streaming chunker over any reader.
///
/// Yields chunks in file order; an empty reader yields nothing.
pub struct Chunker<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> Chunker<R> {
    /// Create a chunker over `reader`.
    pub fn new(reader: R, config: &ChunkerConfig) -> Self {
        Self {
            inner: StreamCDC::new(reader, config.min_size, config.avg_size, config.max_size),
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = match self.inner.next()? {
            Ok(chunk) => chunk,
            Err(fastcdc::v2020::Error::IoError(e)) => return Some(Err(Error::from(e))),
            Err(e) => return Some(Err(Error::chunking(e.to_string()))),
        };

        Some(Ok(Chunk {
            id: Id::hash_bytes(&chunk.data),
            data: chunk.data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ChunkerConfig {
        ChunkerConfig {
            min_size: 1024,
            avg_size: 4096,
            max_size: 16 * 1024,
        }
    }

    fn chunk_all(data: &[u8], config: &ChunkerConfig) -> Vec<Chunk> {
        Chunker::new(data, config)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_chunks_reassemble_in_order() {
        let data = (0..200 * 1024)
            .map(|i| ((i * 31) % 251) as u8)
            .collect::<Vec<_>>();
        let config = small_config();

        let chunks = chunk_all(&data, &config);
        assert!(chunks.len() > 1, "Expected several chunks, got {}", chunks.len());

        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(reassembled, data);

        for chunk in &chunks {
            assert!(chunk.data.len() <= config.max_size as usize);
            assert_eq!(chunk.id, Id::hash_bytes(&chunk.data));
        }
    }

    #[test]
    fn test_deterministic() {
        let data = vec![42u8; 2 * 1024 * 1024];
        let config = ChunkerConfig::default();

        let ids1: Vec<Id> = chunk_all(&data, &config).iter().map(|c| c.id).collect();
        let ids2: Vec<Id> = chunk_all(&data, &config).iter().map(|c| c.id).collect();
        assert_eq!(ids1, ids2, "Chunk ids should be deterministic");
    }

    #[test]
    fn test_small_file_single_chunk() {
        let data = vec![7u8; 100 * 1024];
        let chunks = chunk_all(&data, &ChunkerConfig::default());

        assert_eq!(chunks.len(), 1, "Small file should create single chunk");
        assert_eq!(chunks[0].id, Id::hash_bytes(&data));
    }

    #[test]
    fn test_empty_file() {
        let chunks = chunk_all(&[], &ChunkerConfig::default());
        assert!(chunks.is_empty(), "Empty file should create no chunks");
    }

    #[test]
    fn test_shared_prefix_shares_chunks() {
        let config = small_config();
        let base = (0..128 * 1024)
            .map(|i| ((i * 7 + i / 13) % 256) as u8)
            .collect::<Vec<_>>();
        let mut extended = base.clone();
        extended.extend_from_slice(b"appended tail");

        let a: Vec<Id> = chunk_all(&base, &config).iter().map(|c| c.id).collect();
        let b: Vec<Id> = chunk_all(&extended, &config).iter().map(|c| c.id).collect();

        // Everything but the final chunk is unaffected by appending.
        assert_eq!(a[..a.len() - 1], b[..a.len() - 1]);
    }
}
