//! HTTP range transport: one tokio task per window pushes body chunks into a channel
//! that `read_available` drains on the tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pack_core::{ByteRange, StreamHandle, Transport, TransportError};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Delivery = Result<Vec<u8>, TransportError>;

struct Stream {
    rx: UnboundedReceiver<Delivery>,
    task: JoinHandle<()>,
    /// Error that arrived behind bytes; reported on the next read.
    pending_error: Option<TransportError>,
}

pub struct HttpTransport {
    client: Client,
    runtime: Handle,
    streams: HashMap<u64, Stream>,
    next_handle: u64,
    /// Set once the server answers a range request with the whole body.
    range_ignored: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn new(runtime: Handle, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pack-fetch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            runtime,
            streams: HashMap::new(),
            next_handle: 0,
            range_ignored: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }
}

impl Transport for HttpTransport {
    fn open_stream(&mut self, url: &str, range: ByteRange) -> Result<StreamHandle, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = url.to_string();
        let range_ignored = self.range_ignored.clone();
        debug!(url = %url, offset = range.offset, len = range.len, "open range");
        let task = self.runtime.spawn(async move {
            if let Err(e) = fetch_range(&client, &url, range, &range_ignored, &tx).await {
                let _ = tx.send(Err(e));
            }
        });
        self.next_handle += 1;
        self.streams.insert(
            self.next_handle,
            Stream {
                rx,
                task,
                pending_error: None,
            },
        );
        Ok(StreamHandle(self.next_handle))
    }

    fn read_available(&mut self, handle: StreamHandle) -> Result<Vec<u8>, TransportError> {
        let stream = self
            .streams
            .get_mut(&handle.0)
            .ok_or(TransportError::UnknownStream)?;
        if let Some(err) = stream.pending_error.take() {
            return Err(err);
        }
        let mut out = Vec::new();
        loop {
            match stream.rx.try_recv() {
                Ok(Ok(bytes)) => out.extend_from_slice(&bytes),
                Ok(Err(err)) if out.is_empty() => return Err(err),
                Ok(Err(err)) => {
                    stream.pending_error = Some(err);
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(out)
    }

    fn close(&mut self, handle: StreamHandle) {
        if let Some(stream) = self.streams.remove(&handle.0) {
            stream.task.abort();
        }
    }

    fn supports_resume(&self) -> bool {
        !self.range_ignored.load(Ordering::Relaxed)
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.task.abort();
        }
    }
}

async fn fetch_range(
    client: &Client,
    url: &str,
    range: ByteRange,
    range_ignored: &AtomicBool,
    tx: &UnboundedSender<Delivery>,
) -> Result<(), TransportError> {
    let mut resp = client
        .get(url)
        .header(RANGE, range.to_http_header())
        .send()
        .await
        .map_err(map_reqwest)?;
    if resp.status() == StatusCode::OK && !range_ignored.swap(true, Ordering::Relaxed) {
        warn!(url = %url, "server ignores byte ranges, reading every window from the start");
    }
    check_status(resp.status(), url, range)?;

    // A 200 at offset 0 carries the whole resource; only the window is forwarded.
    let mut remaining = range.len;
    while remaining > 0 {
        let Some(chunk) = resp.chunk().await.map_err(map_reqwest)? else {
            return Err(TransportError::ConnectionLost(format!(
                "body ended {remaining} bytes short"
            )));
        };
        let take = (chunk.len() as u64).min(remaining) as usize;
        remaining -= take as u64;
        if tx.send(Ok(chunk[..take].to_vec())).is_err() {
            // Stream closed by the core.
            return Ok(());
        }
    }
    Ok(())
}

fn check_status(status: StatusCode, url: &str, range: ByteRange) -> Result<(), TransportError> {
    match status {
        StatusCode::PARTIAL_CONTENT => Ok(()),
        StatusCode::OK if range.offset == 0 => Ok(()),
        StatusCode::OK => Err(TransportError::RangeNotSupported),
        StatusCode::NOT_FOUND => Err(TransportError::NotFound(url.to_string())),
        other => Err(TransportError::ConnectionLost(format!("HTTP {other}"))),
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::ConnectionLost(e.to_string())
    }
}
