//! Peer cache protocol: a peer asks for a mounted entry window by window and reassembles it.

use serde::{Deserialize, Serialize};

use crate::chunk::{self, ChunkAssembler, ChunkReceiveResult};
use crate::integrity;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Peer messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Ask for window `chunk_index` of a mounted entry.
    ChunkRequest {
        version: u8,
        pack: String,
        file: String,
        chunk_index: u64,
    },
    /// One window of the decompressed entry with its CRC-32.
    ChunkData {
        pack: String,
        file: String,
        chunk_index: u64,
        chunk_count: u64,
        checksum: u32,
        payload: Vec<u8>,
    },
    /// Entry not mounted here (or window past the end).
    Unavailable { pack: String, file: String },
}

impl Message {
    pub fn chunk_request(pack: &str, file: &str, chunk_index: u64) -> Self {
        Message::ChunkRequest {
            version: PROTOCOL_VERSION,
            pack: pack.to_string(),
            file: file.to_string(),
            chunk_index,
        }
    }
}

/// Build the reply to a window request, given the entry bytes if they are mounted.
pub fn serve_chunk(
    pack: &str,
    file: &str,
    data: Option<&[u8]>,
    chunk_index: u64,
    chunk_size: u64,
) -> Message {
    let unavailable = || Message::Unavailable {
        pack: pack.to_string(),
        file: file.to_string(),
    };
    let Some(data) = data else {
        return unavailable();
    };
    let chunk_count = chunk::chunk_count(data.len() as u64, chunk_size);
    if chunk_index >= chunk_count.max(1) {
        return unavailable();
    }
    let payload = chunk::get_chunk(data, chunk_index, chunk_size).to_vec();
    Message::ChunkData {
        pack: pack.to_string(),
        file: file.to_string(),
        chunk_index,
        chunk_count,
        checksum: integrity::compute(&payload),
        payload,
    }
}

/// What a `PeerFetch` wants next.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerStep {
    /// Send this message to the peer.
    Request(Message),
    /// Every window arrived and verified.
    Complete(Vec<u8>),
    /// Peer does not have the entry.
    Unavailable,
    /// Message was not for this fetch.
    Ignored,
}

/// Client side: fetches one entry from a peer, re-asking for windows that fail their checksum.
#[derive(Debug)]
pub struct PeerFetch {
    pack: String,
    file: String,
    assembler: Option<ChunkAssembler>,
}

impl PeerFetch {
    pub fn new(pack: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            pack: pack.into(),
            file: file.into(),
            assembler: None,
        }
    }

    pub fn first_request(&self) -> Message {
        Message::chunk_request(&self.pack, &self.file, 0)
    }

    pub fn on_message(&mut self, msg: Message) -> PeerStep {
        match msg {
            Message::ChunkData {
                pack,
                file,
                chunk_index,
                chunk_count,
                checksum,
                payload,
            } if pack == self.pack && file == self.file => {
                if chunk_count == 0 {
                    return PeerStep::Complete(Vec::new());
                }
                let assembler = self
                    .assembler
                    .get_or_insert_with(|| ChunkAssembler::new(chunk_count));
                if assembler.chunk_count() != chunk_count {
                    return PeerStep::Ignored;
                }
                match assembler.accept(chunk_index, checksum, payload) {
                    ChunkReceiveResult::Complete(bytes) => PeerStep::Complete(bytes),
                    ChunkReceiveResult::InProgress => match assembler.next_missing() {
                        Some(next) => {
                            PeerStep::Request(Message::chunk_request(&self.pack, &self.file, next))
                        }
                        None => PeerStep::Ignored,
                    },
                    ChunkReceiveResult::IntegrityFailed => PeerStep::Request(
                        Message::chunk_request(&self.pack, &self.file, chunk_index),
                    ),
                    ChunkReceiveResult::OutOfRange => PeerStep::Ignored,
                }
            }
            Message::Unavailable { pack, file } if pack == self.pack && file == self.file => {
                PeerStep::Unavailable
            }
            _ => PeerStep::Ignored,
        }
    }
}
