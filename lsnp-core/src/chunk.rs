//! Chunking: split an outbound file into fixed-size chunks, reassemble inbound chunks.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Upper bound so a base64 chunk plus envelope fields stays inside one datagram.
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

/// Clamp a configured chunk size into `1..=MAX_CHUNK_SIZE` (0 means default).
pub fn effective_chunk_size(configured: usize) -> usize {
    match configured {
        0 => DEFAULT_CHUNK_SIZE,
        n => n.min(MAX_CHUNK_SIZE),
    }
}

/// Number of chunks for a file. An empty file still travels as one empty chunk.
pub fn total_chunks(file_size: u64, chunk_size: usize) -> u64 {
    let size = effective_chunk_size(chunk_size) as u64;
    file_size.div_ceil(size).max(1)
}

pub fn encode_chunk_data(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

pub fn decode_chunk_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

/// Progress after storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    InProgress { received: u64, total: u64 },
    Complete,
}

/// Sparse index → bytes map for one inbound file. The total is learned from the
/// first chunk and must never change afterwards.
#[derive(Debug, Default)]
pub struct ChunkAssembly {
    total: Option<u64>,
    received: BTreeMap<u64, Vec<u8>>,
}

impl ChunkAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn received(&self) -> u64 {
        self.received.len() as u64
    }

    /// Store a chunk. A repeated index overwrites the earlier payload.
    pub fn insert(
        &mut self,
        index: u64,
        total: u64,
        payload: Vec<u8>,
    ) -> Result<ChunkProgress, AssemblyError> {
        if total == 0 {
            return Err(AssemblyError::EmptyTotal);
        }
        match self.total {
            Some(known) if known != total => {
                return Err(AssemblyError::TotalMismatch {
                    expected: known,
                    got: total,
                })
            }
            _ => {}
        }
        if index >= total {
            return Err(AssemblyError::IndexOutOfRange { index, total });
        }
        self.total = Some(total);
        self.received.insert(index, payload);
        if self.is_complete() {
            Ok(ChunkProgress::Complete)
        } else {
            Ok(ChunkProgress::InProgress {
                received: self.received(),
                total,
            })
        }
    }

    /// Complete only when the count matches the total and no index in `0..total` is missing.
    pub fn is_complete(&self) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        self.received() == total && (0..total).all(|i| self.received.contains_key(&i))
    }

    /// Concatenate chunks in index order. `None` while any chunk is missing.
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let len = self.received.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for payload in self.received.values() {
            out.extend_from_slice(payload);
        }
        Some(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("chunk declares {got} total chunks but {expected} were announced")]
    TotalMismatch { expected: u64, got: u64 },
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u64, total: u64 },
    #[error("chunk declares zero total chunks")]
    EmptyTotal,
}
