//! Scripted in-memory transport with fault injection, for state machine and facade tests.

use std::collections::{HashMap, VecDeque};

use crate::transport::{ByteRange, StreamHandle, Transport, TransportError};

#[derive(Debug)]
struct MemStream {
    url: String,
    cursor: u64,
    end: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryTransport {
    resources: HashMap<String, Vec<u8>>,
    streams: HashMap<u64, MemStream>,
    next_handle: u64,
    /// Max bytes per `read_available`; 0 means the whole window.
    burst: usize,
    non_resumable: bool,
    open_faults: VecDeque<TransportError>,
    read_faults: VecDeque<TransportError>,
    /// (url, absolute offset): one is flipped per delivery covering it, then dropped.
    corruptions: Vec<(String, u64)>,
    stalled: Vec<String>,
    opened: Vec<(String, ByteRange)>,
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&mut self, url: &str, bytes: Vec<u8>) {
        self.resources.insert(url.to_string(), bytes);
    }

    pub(crate) fn set_burst(&mut self, burst: usize) {
        self.burst = burst;
    }

    pub(crate) fn set_resumable(&mut self, resumable: bool) {
        self.non_resumable = !resumable;
    }

    pub(crate) fn fail_next_open(&mut self, err: TransportError) {
        self.open_faults.push_back(err);
    }

    pub(crate) fn fail_next_read(&mut self, err: TransportError) {
        self.read_faults.push_back(err);
    }

    pub(crate) fn corrupt_once(&mut self, url: &str, offset: u64) {
        self.corruptions.push((url.to_string(), offset));
    }

    /// Streams for `url` open fine but never deliver.
    pub(crate) fn stall(&mut self, url: &str) {
        self.stalled.push(url.to_string());
    }

    pub(crate) fn unstall(&mut self, url: &str) {
        self.stalled.retain(|u| u != url);
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn opened(&self) -> &[(String, ByteRange)] {
        &self.opened
    }
}

impl Transport for MemoryTransport {
    fn open_stream(&mut self, url: &str, range: ByteRange) -> Result<StreamHandle, TransportError> {
        if let Some(err) = self.open_faults.pop_front() {
            return Err(err);
        }
        let Some(resource) = self.resources.get(url) else {
            return Err(TransportError::NotFound(url.to_string()));
        };
        if self.non_resumable && range.offset > 0 {
            return Err(TransportError::RangeNotSupported);
        }
        let end = range.end().min(resource.len() as u64);
        self.next_handle += 1;
        self.streams.insert(
            self.next_handle,
            MemStream {
                url: url.to_string(),
                cursor: range.offset,
                end,
            },
        );
        self.opened.push((url.to_string(), range));
        Ok(StreamHandle(self.next_handle))
    }

    fn read_available(&mut self, handle: StreamHandle) -> Result<Vec<u8>, TransportError> {
        let stream = self
            .streams
            .get_mut(&handle.0)
            .ok_or(TransportError::UnknownStream)?;
        if let Some(err) = self.read_faults.pop_front() {
            return Err(err);
        }
        if self.stalled.contains(&stream.url) {
            return Ok(Vec::new());
        }
        let Some(resource) = self.resources.get(&stream.url) else {
            return Err(TransportError::NotFound(stream.url.clone()));
        };
        let mut stop = stream.end;
        if self.burst > 0 {
            stop = stop.min(stream.cursor + self.burst as u64);
        }
        let start = stream.cursor;
        let mut out = resource[start as usize..stop as usize].to_vec();
        stream.cursor = stop;

        let hit = self
            .corruptions
            .iter()
            .position(|(u, at)| *u == stream.url && (start..stop).contains(at));
        if let Some(i) = hit {
            let (_, at) = self.corruptions.remove(i);
            out[(at - start) as usize] ^= 0xff;
        }
        Ok(out)
    }

    fn close(&mut self, handle: StreamHandle) {
        self.streams.remove(&handle.0);
    }

    fn supports_resume(&self) -> bool {
        !self.non_resumable
    }
}
