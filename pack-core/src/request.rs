//! Per-request state machine: download windows, verify, decode. Never blocks.
//!
//! ```text
//! Queued -> Downloading -> Verifying -> Ready
//!               ^   |          |
//!               |   v          |
//!             Retrying <-------+        any -> Failed(reason)
//! ```

use tracing::{debug, info, warn};

use crate::archive::{self, CompressionMethod, FileTableEntry, FormatError, HeaderInfo, PackIndex, HEADER_SIZE};
use crate::chunk;
use crate::codec::Codec;
use crate::config::RetryPolicy;
use crate::integrity;
use crate::transport::{ByteRange, StreamHandle, TransportError};

/// What a request fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Header, names block and file table of a pack.
    RootMetadata,
    /// One payload, by file-table index.
    Entry(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Downloading,
    Retrying,
    Verifying,
    Ready,
    Failed(FailureReason),
}

impl RequestState {
    pub fn is_finished(&self) -> bool {
        matches!(self, RequestState::Ready | RequestState::Failed(_))
    }
}

/// Stable reason reported once a request (or pack) gives up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("integrity check failed")]
    Integrity,
    #[error("transport: {0}")]
    Transport(String),
    #[error("format: {0}")]
    Format(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error("dependency {0} failed")]
    Dependency(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<FormatError> for FailureReason {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::Codec(c) => FailureReason::Codec(c.to_string()),
            e if e.is_integrity() => FailureReason::Integrity,
            e => FailureReason::Format(e.to_string()),
        }
    }
}

/// Snapshot returned by every `update`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub received: u64,
    /// Unknown for a root request until its header arrives.
    pub total: Option<u64>,
    pub state_changed: bool,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        match self.total {
            None => 0.0,
            Some(0) => 1.0,
            Some(t) => (self.received as f64 / t as f64).min(1.0) as f32,
        }
    }
}

/// Product of a Ready request, taken once by the facade.
#[derive(Debug)]
pub enum RequestOutput {
    Index(PackIndex),
    Entry { name: String, data: Vec<u8> },
}

#[derive(Debug, Clone)]
struct EntryTarget {
    name: String,
    checksum: u32,
    original_size: u32,
    method: CompressionMethod,
}

#[derive(Debug, Clone, Copy)]
struct OpenStream {
    handle: StreamHandle,
    /// Archive offset of the next byte the stream delivers.
    cursor: u64,
    end: u64,
}

/// Key of an entry request: `{pack}/{entry}`.
pub fn entry_key(pack: &str, entry: &str) -> String {
    format!("{pack}/{entry}")
}

#[derive(Debug)]
pub struct PackRequest {
    key: String,
    pack: String,
    url: String,
    kind: RequestKind,
    priority: f32,
    state: RequestState,
    /// Archive bytes from `base_offset`.
    buffer: Vec<u8>,
    base_offset: u64,
    /// None for a root request until the header is parsed.
    target_len: Option<u64>,
    header: Option<HeaderInfo>,
    entry: Option<EntryTarget>,
    /// Prefix of `buffer` that survives an integrity retry.
    durable_len: usize,
    attempts: u32,
    backoff_remaining: u64,
    idle_ticks: u64,
    stream: Option<OpenStream>,
    resumable: bool,
    last_error: Option<String>,
    dependencies: Vec<String>,
    policy: RetryPolicy,
    output: Option<RequestOutput>,
}

impl PackRequest {
    /// Request for a pack's metadata (header, names, table). Keyed by the pack name.
    pub fn root(pack: impl Into<String>, url: impl Into<String>, priority: f32, policy: RetryPolicy) -> Self {
        let pack = pack.into();
        Self::new(pack.clone(), pack, url.into(), RequestKind::RootMetadata, priority, policy)
    }

    /// Request for one payload described by a file-table record.
    pub fn entry(
        pack: impl Into<String>,
        url: impl Into<String>,
        index: usize,
        name: &str,
        record: &FileTableEntry,
        priority: f32,
        policy: RetryPolicy,
    ) -> Self {
        let pack = pack.into();
        let mut req = Self::new(
            entry_key(&pack, name),
            pack,
            url.into(),
            RequestKind::Entry(index),
            priority,
            policy,
        );
        req.base_offset = record.start_offset;
        req.target_len = Some(u64::from(record.compressed_size));
        req.entry = Some(EntryTarget {
            name: name.to_string(),
            checksum: record.checksum,
            original_size: record.original_size,
            method: record.method,
        });
        req
    }

    fn new(
        key: String,
        pack: String,
        url: String,
        kind: RequestKind,
        priority: f32,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            key,
            pack,
            url,
            kind,
            priority,
            state: RequestState::Queued,
            buffer: Vec::new(),
            base_offset: 0,
            target_len: None,
            header: None,
            entry: None,
            durable_len: 0,
            attempts: 0,
            backoff_remaining: 0,
            idle_ticks: 0,
            stream: None,
            resumable: true,
            last_error: None,
            dependencies: Vec::new(),
            policy,
            output: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pack(&self) -> &str {
        &self.pack
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: f32) {
        self.priority = priority;
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn total(&self) -> Option<u64> {
        self.target_len
    }

    pub fn progress(&self) -> Progress {
        Progress {
            received: self.received(),
            total: self.total(),
            state_changed: false,
        }
    }

    pub fn stream(&self) -> Option<StreamHandle> {
        self.stream.map(|s| s.handle)
    }

    /// Whether retries may keep already received bytes.
    pub fn set_resumable(&mut self, resumable: bool) {
        self.resumable = resumable;
    }

    fn position(&self) -> u64 {
        self.base_offset + self.buffer.len() as u64
    }

    /// `Queued -> Downloading`. No effect in any other state.
    pub fn start(&mut self) {
        if self.state == RequestState::Queued {
            self.state = RequestState::Downloading;
            self.idle_ticks = 0;
            debug!(key = %self.key, offset = self.position(), "request started");
        }
    }

    /// Next range to ask the transport for, if downloading with no stream open.
    pub fn next_window(&self) -> Option<ByteRange> {
        if self.state != RequestState::Downloading || self.stream.is_some() {
            return None;
        }
        let want = self.target_len.unwrap_or(HEADER_SIZE as u64);
        let have = self.received();
        if have >= want {
            return None;
        }
        if !self.resumable {
            // One stream from the start of the archive; bytes already held are skipped on arrival.
            return Some(ByteRange::new(0, self.base_offset + want));
        }
        let len = (want - have).min(chunk::effective_chunk_size(self.policy.chunk_size));
        Some(ByteRange::new(self.position(), len))
    }

    pub fn attach_stream(&mut self, handle: StreamHandle, range: ByteRange) {
        self.stream = Some(OpenStream {
            handle,
            cursor: range.offset,
            end: range.end(),
        });
        self.idle_ticks = 0;
    }

    /// Hand back the stream once its window is complete or the request left `Downloading`.
    pub fn take_idle_stream(&mut self) -> Option<StreamHandle> {
        let idle = match self.stream {
            Some(s) => self.state != RequestState::Downloading || self.position() >= s.end,
            None => false,
        };
        if idle {
            self.stream.take().map(|s| s.handle)
        } else {
            None
        }
    }

    /// One tick: append bytes from the current window, count down backoff, or verify.
    pub fn update(&mut self, bytes: &[u8], codec: &dyn Codec) -> Progress {
        let before = std::mem::discriminant(&self.state);
        match self.state {
            RequestState::Downloading => self.receive(bytes),
            RequestState::Retrying => self.count_down(),
            RequestState::Verifying => self.verify(codec),
            RequestState::Queued | RequestState::Ready | RequestState::Failed(_) => {}
        }
        Progress {
            received: self.received(),
            total: self.total(),
            state_changed: before != std::mem::discriminant(&self.state),
        }
    }

    /// Transport failure on the open stream; received bytes are kept when resumable.
    pub fn on_transport_error(&mut self, err: TransportError) {
        if self.state != RequestState::Downloading {
            return;
        }
        let keep = self.buffer.len();
        self.retry_or_fail(FailureReason::Transport(err.to_string()), keep);
    }

    /// Cancel the download: partial bytes are released and the request is `Queued` again.
    /// Returns the stream for the caller to close.
    pub fn stop(&mut self) -> Option<StreamHandle> {
        let handle = self.stream.take().map(|s| s.handle);
        if !self.is_finished() {
            self.truncate_to(0);
            self.state = RequestState::Queued;
            self.idle_ticks = 0;
            self.backoff_remaining = 0;
        }
        handle
    }

    /// Preemption: back to `Queued` but received bytes are kept.
    /// A request waiting out a backoff stays `Retrying` with the ticks it has left.
    pub fn pause(&mut self) -> Option<StreamHandle> {
        let handle = self.stream.take().map(|s| s.handle);
        match self.state {
            RequestState::Downloading | RequestState::Verifying => {
                debug!(key = %self.key, received = self.buffer.len(), "request paused");
                self.state = RequestState::Queued;
                self.idle_ticks = 0;
            }
            RequestState::Retrying => {
                debug!(key = %self.key, backoff = self.backoff_remaining, "request paused in backoff");
            }
            RequestState::Queued | RequestState::Ready | RequestState::Failed(_) => {}
        }
        handle
    }

    /// Force a final failure (cancel, failed dependency).
    pub fn fail(&mut self, reason: FailureReason) {
        self.buffer = Vec::new();
        self.last_error = Some(reason.to_string());
        self.state = RequestState::Failed(reason);
    }

    pub fn take_output(&mut self) -> Option<RequestOutput> {
        self.output.take()
    }

    fn receive(&mut self, bytes: &[u8]) {
        match self.stream {
            Some(s) if !bytes.is_empty() => {
                let start = s.cursor;
                let end = start + bytes.len() as u64;
                if let Some(open) = self.stream.as_mut() {
                    open.cursor = end;
                }
                let pos = self.position();
                let stop = end.min(s.end);
                if start <= pos && stop > pos {
                    let from = (pos - start) as usize;
                    let to = (stop - start) as usize;
                    self.buffer.extend_from_slice(&bytes[from..to]);
                }
                self.idle_ticks = 0;
                debug!(key = %self.key, bytes = bytes.len(), received = self.buffer.len(), "window bytes");
            }
            Some(s) if self.position() < s.end => {
                self.idle_ticks += 1;
                let limit = self.policy.stall_timeout_ticks;
                if limit > 0 && self.idle_ticks >= limit {
                    let keep = self.buffer.len();
                    self.retry_or_fail(FailureReason::Transport("stream stalled".into()), keep);
                    return;
                }
            }
            _ => {}
        }

        if self.kind == RequestKind::RootMetadata
            && self.header.is_none()
            && self.buffer.len() >= HEADER_SIZE
        {
            match archive::read_header(&self.buffer) {
                Ok(header) => {
                    self.header = Some(header);
                    self.target_len = Some(header.metadata_len());
                    self.durable_len = HEADER_SIZE;
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "bad pack header");
                    self.fail(e.into());
                    return;
                }
            }
        }

        if let Some(target) = self.target_len {
            if self.received() >= target {
                self.state = RequestState::Verifying;
            }
        }
    }

    fn count_down(&mut self) {
        self.backoff_remaining = self.backoff_remaining.saturating_sub(1);
        if self.backoff_remaining == 0 {
            self.state = RequestState::Downloading;
            self.idle_ticks = 0;
            debug!(key = %self.key, offset = self.position(), "request resumed");
        }
    }

    fn verify(&mut self, codec: &dyn Codec) {
        match self.kind {
            RequestKind::RootMetadata => self.verify_metadata(codec),
            RequestKind::Entry(_) => self.verify_entry(codec),
        }
    }

    fn verify_metadata(&mut self, codec: &dyn Codec) {
        let Some(header) = self.header else {
            self.fail(FailureReason::Format("metadata verified without a header".into()));
            return;
        };
        if let Err(e) = archive::verify_names_section(&self.buffer, &header) {
            self.section_failed(e, HEADER_SIZE);
            return;
        }
        self.durable_len = header.start_of_file_table() as usize;
        if let Err(e) = archive::verify_table_section(&self.buffer, &header) {
            let keep = self.durable_len;
            self.section_failed(e, keep);
            return;
        }
        let decoded = archive::read_names(&self.buffer, &header, codec).and_then(|names| {
            let entries = archive::read_file_table(&self.buffer, &header)?;
            Ok(PackIndex {
                header,
                names,
                entries,
            })
        });
        match decoded {
            Ok(index) => {
                info!(pack = %self.pack, entries = index.len(), "pack index verified");
                self.buffer = Vec::new();
                self.output = Some(RequestOutput::Index(index));
                self.state = RequestState::Ready;
            }
            Err(e) => {
                warn!(pack = %self.pack, error = %e, "pack index unreadable");
                self.fail(e.into());
            }
        }
    }

    fn section_failed(&mut self, err: FormatError, keep: usize) {
        if err.is_integrity() {
            warn!(key = %self.key, error = %err, "section checksum mismatch");
            self.retry_or_fail(FailureReason::Integrity, keep);
        } else {
            self.fail(err.into());
        }
    }

    fn verify_entry(&mut self, codec: &dyn Codec) {
        let Some(target) = self.entry.clone() else {
            self.fail(FailureReason::Format("entry request without a target".into()));
            return;
        };
        if !integrity::verify(&self.buffer, target.checksum) {
            warn!(key = %self.key, expected = target.checksum, "entry checksum mismatch");
            self.retry_or_fail(FailureReason::Integrity, 0);
            return;
        }
        match codec.decompress(target.method, &self.buffer, target.original_size as usize) {
            Ok(data) => {
                debug!(key = %self.key, size = data.len(), "entry decoded");
                self.buffer = Vec::new();
                self.output = Some(RequestOutput::Entry {
                    name: target.name,
                    data,
                });
                self.state = RequestState::Ready;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "entry failed to decode");
                self.fail(FailureReason::Codec(e.to_string()));
            }
        }
    }

    fn retry_or_fail(&mut self, reason: FailureReason, keep: usize) {
        self.attempts += 1;
        self.last_error = Some(reason.to_string());
        if self.attempts >= self.policy.max_attempts {
            warn!(key = %self.key, attempts = self.attempts, reason = %reason, "request failed");
            self.fail(reason);
            return;
        }
        let keep = if self.resumable { keep } else { 0 };
        self.truncate_to(keep);
        self.backoff_remaining = self.policy.backoff_ticks(self.attempts).max(1);
        self.idle_ticks = 0;
        self.state = RequestState::Retrying;
        warn!(
            key = %self.key,
            attempt = self.attempts,
            resume_at = self.position(),
            backoff = self.backoff_remaining,
            reason = %reason,
            "request retrying"
        );
    }

    fn truncate_to(&mut self, keep: usize) {
        if keep == 0 {
            self.buffer = Vec::new();
        } else {
            self.buffer.truncate(keep);
        }
        self.durable_len = self.durable_len.min(self.buffer.len());
        if self.kind == RequestKind::RootMetadata && self.buffer.len() < HEADER_SIZE {
            self.header = None;
            self.target_len = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{read_header, read_index, PackWriter};
    use crate::codec::DefaultCodec;

    fn policy(chunk_size: u64) -> RetryPolicy {
        RetryPolicy {
            chunk_size,
            ..RetryPolicy::default()
        }
    }

    fn sample_archive() -> Vec<u8> {
        let mut w = PackWriter::new();
        w.add("a.txt", b"alpha alpha alpha alpha alpha".to_vec(), CompressionMethod::Lz4)
            .add("b.bin", vec![9u8; 700], CompressionMethod::Deflate)
            .add("c.cfg", b"x=1".to_vec(), CompressionMethod::None);
        w.encode(&DefaultCodec).unwrap()
    }

    /// Drive one window from `archive` through the request, like the manager does.
    fn feed_window(req: &mut PackRequest, archive: &[u8], handle: u64) -> bool {
        let Some(range) = req.next_window() else {
            return false;
        };
        req.attach_stream(StreamHandle(handle), range);
        let bytes = &archive[range.offset as usize..range.end() as usize];
        req.update(bytes, &DefaultCodec);
        assert_eq!(req.take_idle_stream(), Some(StreamHandle(handle)));
        true
    }

    fn download(req: &mut PackRequest, archive: &[u8]) {
        let mut handle = 0;
        while feed_window(req, archive, handle) {
            handle += 1;
        }
    }

    #[test]
    fn start_twice_is_start_once() {
        let mut req = PackRequest::root("base", "mem://base.pack", 1.0, policy(64));
        req.start();
        let after_one = (req.state().clone(), req.next_window());
        req.start();
        assert_eq!((req.state().clone(), req.next_window()), after_one);
        assert_eq!(req.state(), &RequestState::Downloading);
    }

    #[test]
    fn root_metadata_yields_index() {
        let archive = sample_archive();
        let mut req = PackRequest::root("base", "mem://base.pack", 1.0, policy(16));
        req.start();
        assert_eq!(req.next_window(), Some(ByteRange::new(0, 16)));
        download(&mut req, &archive);
        assert_eq!(req.state(), &RequestState::Verifying);
        let header = read_header(&archive).unwrap();
        assert_eq!(req.total(), Some(header.metadata_len()));

        let p = req.update(&[], &DefaultCodec);
        assert!(p.state_changed);
        assert_eq!(req.state(), &RequestState::Ready);
        match req.take_output() {
            Some(RequestOutput::Index(index)) => {
                assert_eq!(index, read_index(&archive, &DefaultCodec).unwrap())
            }
            other => panic!("expected index, got {other:?}"),
        }
    }

    #[test]
    fn entry_downloads_in_windows_and_decodes() {
        let archive = sample_archive();
        let index = read_index(&archive, &DefaultCodec).unwrap();
        let i = index.find("b.bin").unwrap();
        let (name, record) = index.entry(i).unwrap();
        let mut req = PackRequest::entry("base", "u", i, name, record, 1.0, policy(8));
        assert_eq!(req.key(), "base/b.bin");
        req.start();
        assert_eq!(
            req.next_window().map(|r| r.offset),
            Some(record.start_offset)
        );
        download(&mut req, &archive);
        req.update(&[], &DefaultCodec);
        assert_eq!(req.state(), &RequestState::Ready);
        match req.take_output() {
            Some(RequestOutput::Entry { name, data }) => {
                assert_eq!(name, "b.bin");
                assert_eq!(data, vec![9u8; 700]);
            }
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn wrong_checksum_retries_then_fails() {
        let archive = sample_archive();
        let index = read_index(&archive, &DefaultCodec).unwrap();
        let (name, record) = index.entry(0).unwrap();
        let mut bad = *record;
        bad.checksum ^= 1;
        let mut req = PackRequest::entry("base", "u", 0, name, &bad, 1.0, policy(1024));
        req.start();

        for attempt in 1..=3u32 {
            download(&mut req, &archive);
            assert_eq!(req.state(), &RequestState::Verifying);
            req.update(&[], &DefaultCodec);
            assert_eq!(req.attempts(), attempt);
            if attempt < 3 {
                assert_eq!(req.state(), &RequestState::Retrying);
                assert_eq!(req.received(), 0);
                req.update(&[], &DefaultCodec);
                assert_eq!(req.state(), &RequestState::Downloading);
            }
        }
        assert_eq!(
            req.state(),
            &RequestState::Failed(FailureReason::Integrity)
        );
    }

    #[test]
    fn corrupt_table_keeps_verified_names() {
        let clean = sample_archive();
        let header = read_header(&clean).unwrap();
        let mut damaged = clean.clone();
        damaged[header.start_of_file_table() as usize + 3] ^= 0x40;

        let mut req = PackRequest::root("base", "u", 1.0, policy(4096));
        req.start();
        download(&mut req, &damaged);
        req.update(&[], &DefaultCodec);
        assert_eq!(req.state(), &RequestState::Retrying);
        assert_eq!(req.received(), header.start_of_file_table());

        req.update(&[], &DefaultCodec);
        let window = req.next_window().unwrap();
        assert_eq!(window.offset, header.start_of_file_table());
        assert_eq!(window.end(), header.metadata_len());

        download(&mut req, &clean);
        req.update(&[], &DefaultCodec);
        assert_eq!(req.state(), &RequestState::Ready);
    }

    #[test]
    fn non_resumable_transport_rereads_from_zero() {
        let archive = sample_archive();
        let header = read_header(&archive).unwrap();
        let mut req = PackRequest::root("base", "u", 1.0, policy(8));
        req.set_resumable(false);
        req.start();
        assert_eq!(req.next_window(), Some(ByteRange::new(0, HEADER_SIZE as u64)));
        feed_window(&mut req, &archive, 1);
        assert_eq!(req.received(), HEADER_SIZE as u64);

        // Whole metadata in one stream from offset 0; the header bytes are skipped.
        assert_eq!(req.next_window(), Some(ByteRange::new(0, header.metadata_len())));
        let range = req.next_window().unwrap();
        req.attach_stream(StreamHandle(2), range);
        req.update(&archive[..20], &DefaultCodec);
        assert_eq!(req.received(), HEADER_SIZE as u64);
        req.on_transport_error(TransportError::ConnectionLost("reset".into()));
        assert_eq!(req.state(), &RequestState::Retrying);
        assert_eq!(req.take_idle_stream(), Some(StreamHandle(2)));
        assert_eq!(req.received(), 0);

        req.update(&[], &DefaultCodec);
        download(&mut req, &archive);
        req.update(&[], &DefaultCodec);
        assert_eq!(req.state(), &RequestState::Ready);
    }

    #[test]
    fn non_resumable_entry_skips_to_its_offset() {
        let archive = sample_archive();
        let index = read_index(&archive, &DefaultCodec).unwrap();
        let i = index.find("c.cfg").unwrap();
        let (name, record) = index.entry(i).unwrap();
        let mut req = PackRequest::entry("base", "u", i, name, record, 1.0, policy(4));
        req.set_resumable(false);
        req.start();
        let range = req.next_window().unwrap();
        assert_eq!(range, ByteRange::new(0, record.end_offset()));
        req.attach_stream(StreamHandle(1), range);
        // Deliver in uneven pieces straddling the entry start.
        let mut at = 0;
        for piece in archive[..range.end() as usize].chunks(7) {
            req.update(piece, &DefaultCodec);
            at += piece.len();
        }
        assert_eq!(at as u64, record.end_offset());
        assert_eq!(req.received(), u64::from(record.compressed_size));
        req.update(&[], &DefaultCodec);
        match req.take_output() {
            Some(RequestOutput::Entry { data, .. }) => assert_eq!(data, b"x=1".to_vec()),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn resumable_transport_keeps_partial_bytes() {
        let archive = sample_archive();
        let mut req = PackRequest::root("base", "u", 1.0, policy(8));
        req.start();
        feed_window(&mut req, &archive, 1);
        let range = req.next_window().unwrap();
        req.attach_stream(StreamHandle(2), range);
        req.update(&archive[8..11], &DefaultCodec);
        req.on_transport_error(TransportError::Timeout);
        assert_eq!(req.received(), 11);
        req.take_idle_stream();
        req.update(&[], &DefaultCodec);
        assert_eq!(req.next_window().map(|r| r.offset), Some(11));
    }

    #[test]
    fn stalled_stream_uses_retry_budget() {
        let mut req = PackRequest::root(
            "base",
            "u",
            1.0,
            RetryPolicy {
                max_attempts: 1,
                stall_timeout_ticks: 2,
                ..RetryPolicy::default()
            },
        );
        req.start();
        let range = req.next_window().unwrap();
        req.attach_stream(StreamHandle(1), range);
        req.update(&[], &DefaultCodec);
        assert_eq!(req.state(), &RequestState::Downloading);
        req.update(&[], &DefaultCodec);
        assert!(matches!(
            req.state(),
            RequestState::Failed(FailureReason::Transport(_))
        ));
    }

    #[test]
    fn bytes_past_window_are_dropped() {
        let archive = sample_archive();
        let mut req = PackRequest::root("base", "u", 1.0, policy(10));
        req.start();
        let range = req.next_window().unwrap();
        req.attach_stream(StreamHandle(1), range);
        req.update(&archive[..30], &DefaultCodec);
        assert_eq!(req.received(), 10);
    }

    #[test]
    fn bad_marker_fails_as_format() {
        let mut archive = sample_archive();
        archive[0] = b'X';
        let mut req = PackRequest::root("base", "u", 1.0, policy(64));
        req.start();
        download(&mut req, &archive);
        assert!(matches!(
            req.state(),
            RequestState::Failed(FailureReason::Format(_))
        ));
    }

    #[test]
    fn stop_releases_and_pause_keeps() {
        let archive = sample_archive();
        let mut req = PackRequest::root("base", "u", 1.0, policy(8));
        req.start();
        feed_window(&mut req, &archive, 1);
        let range = req.next_window().unwrap();
        req.attach_stream(StreamHandle(7), range);

        assert_eq!(req.pause(), Some(StreamHandle(7)));
        assert_eq!(req.state(), &RequestState::Queued);
        assert_eq!(req.received(), 8);

        req.start();
        assert_eq!(req.next_window().map(|r| r.offset), Some(8));
        assert_eq!(req.stop(), None);
        assert_eq!(req.state(), &RequestState::Queued);
        assert_eq!(req.received(), 0);
    }

    #[test]
    fn pause_during_backoff_keeps_waiting() {
        let mut req = PackRequest::root(
            "base",
            "u",
            1.0,
            RetryPolicy {
                backoff_base_ticks: 4,
                ..RetryPolicy::default()
            },
        );
        req.start();
        let range = req.next_window().unwrap();
        req.attach_stream(StreamHandle(1), range);
        req.on_transport_error(TransportError::Timeout);
        assert_eq!(req.state(), &RequestState::Retrying);
        req.update(&[], &DefaultCodec);

        assert_eq!(req.pause(), Some(StreamHandle(1)));
        assert_eq!(req.state(), &RequestState::Retrying);
        req.start();
        assert_eq!(req.state(), &RequestState::Retrying);
        assert_eq!(req.next_window(), None);
        for _ in 0..2 {
            req.update(&[], &DefaultCodec);
            assert_eq!(req.state(), &RequestState::Retrying);
        }
        req.update(&[], &DefaultCodec);
        assert_eq!(req.state(), &RequestState::Downloading);
    }

    #[test]
    fn progress_fraction() {
        let p = Progress {
            received: 25,
            total: Some(100),
            state_changed: false,
        };
        assert!((p.fraction() - 0.25).abs() < f32::EPSILON);
        assert_eq!(
            Progress {
                received: 0,
                total: None,
                state_changed: false
            }
            .fraction(),
            0.0
        );
    }
}
