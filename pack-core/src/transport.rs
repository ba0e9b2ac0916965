//! Transport seam: where request bytes come from. The core never does I/O itself.

/// Opaque id of one open byte stream, minted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Absolute archive byte range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// HTTP `Range` header value (inclusive end).
    pub fn to_http_header(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end().saturating_sub(1))
    }
}

/// Byte-stream source polled once per tick.
pub trait Transport {
    /// Begin fetching `range` of the resource at `url`.
    fn open_stream(&mut self, url: &str, range: ByteRange) -> Result<StreamHandle, TransportError>;

    /// Bytes that arrived since the last call; empty when nothing is new. Must not block.
    fn read_available(&mut self, handle: StreamHandle) -> Result<Vec<u8>, TransportError>;

    /// Stop a stream. Closing an unknown or already closed handle is a no-op.
    fn close(&mut self, handle: StreamHandle);

    /// Whether a range may start mid-resource, so a retry can keep verified bytes.
    fn supports_resume(&self) -> bool {
        true
    }
}

/// Transport failures. All of them are retried under the request's attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("timed out")]
    Timeout,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("server ignored the byte range")]
    RangeNotSupported,
    #[error("unknown stream")]
    UnknownStream,
}
