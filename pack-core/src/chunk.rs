//! Chunk splitter: fixed-size windows over a byte range, and reassembly of windows.

use std::collections::HashMap;
use std::ops::Range;

use crate::integrity;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Window size actually used: 0 means default.
pub fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Number of windows covering `len` bytes (`ceil(len / chunk_size)`).
pub fn chunk_count(len: u64, chunk_size: u64) -> u64 {
    len.div_ceil(effective_chunk_size(chunk_size))
}

/// Byte range of window `index` in a buffer of `total` bytes; empty past the last window.
pub fn chunk_range(total: u64, index: u64, chunk_size: u64) -> Range<u64> {
    let size = effective_chunk_size(chunk_size);
    if index >= chunk_count(total, size) {
        return total..total;
    }
    let start = index * size;
    start..(start + size).min(total)
}

/// Window `index` of `buf`, or an empty slice when `index >= chunk_count`.
pub fn get_chunk(buf: &[u8], index: u64, chunk_size: u64) -> &[u8] {
    let range = chunk_range(buf.len() as u64, index, chunk_size);
    &buf[range.start as usize..range.end as usize]
}

/// Rebuilds a buffer from windows that may arrive in any order. Each window carries a CRC-32.
#[derive(Debug)]
pub struct ChunkAssembler {
    chunk_count: u64,
    /// Windows received and verified (index -> payload).
    received: HashMap<u64, Vec<u8>>,
}

/// Result of handing one window to the assembler.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Window stored; every window is present and the buffer is ready.
    Complete(Vec<u8>),
    /// Window stored; more are missing.
    InProgress,
    /// Checksum did not match; window dropped.
    IntegrityFailed,
    /// Index past the declared window count.
    OutOfRange,
}

impl ChunkAssembler {
    pub fn new(chunk_count: u64) -> Self {
        Self {
            chunk_count,
            received: HashMap::new(),
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Verify and store a window. Receiving the same window twice is harmless.
    pub fn accept(&mut self, index: u64, checksum: u32, payload: Vec<u8>) -> ChunkReceiveResult {
        if index >= self.chunk_count {
            return ChunkReceiveResult::OutOfRange;
        }
        if !integrity::verify(&payload, checksum) {
            return ChunkReceiveResult::IntegrityFailed;
        }
        self.received.insert(index, payload);
        if self.is_complete() {
            ChunkReceiveResult::Complete(self.reassemble_into_bytes())
        } else {
            ChunkReceiveResult::InProgress
        }
    }

    pub fn is_complete(&self) -> bool {
        (0..self.chunk_count).all(|i| self.received.contains_key(&i))
    }

    /// Lowest window index still missing.
    pub fn next_missing(&self) -> Option<u64> {
        (0..self.chunk_count).find(|i| !self.received.contains_key(i))
    }

    /// Windows in index order. Call only when `is_complete()`.
    pub fn reassemble_into_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..self.chunk_count {
            if let Some(payload) = self.received.get(&i) {
                out.extend_from_slice(payload);
            }
        }
        out
    }
}
