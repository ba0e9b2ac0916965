//! Request scheduler: priority queue of pack requests over an arena; drives the top one each tick.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::codec::Codec;
use crate::request::PackRequest;
use crate::transport::{StreamHandle, Transport};

/// Handle to a queued request. Stays valid while the arena grows; stale once the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Queued>,
}

#[derive(Debug)]
struct Queued {
    request: PackRequest,
    seq: u64,
}

/// Queue order: higher priority first, then lower insertion sequence.
#[derive(Debug, Clone, Copy)]
struct QueueKey {
    priority: f32,
    seq: u64,
    index: u32,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

/// Owns every live `PackRequest`; only the top of the queue makes progress.
#[derive(Debug, Default)]
pub struct RequestManager {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, RequestId>,
    queue: BTreeSet<QueueKey>,
    next_seq: u64,
    /// Request that owned the transport on the last tick.
    active: Option<RequestId>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, request: PackRequest) -> Result<RequestId, SchedulerError> {
        if request.priority().is_nan() {
            return Err(SchedulerError::InvalidPriority);
        }
        if self.by_name.contains_key(request.key()) {
            return Err(SchedulerError::DuplicateName(request.key().to_string()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = QueueKey {
            priority: request.priority(),
            seq,
            index: 0,
        };
        let name = request.key().to_string();
        let queued = Queued { request, seq };

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(queued);
                RequestId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(queued),
                });
                RequestId {
                    index,
                    generation: 0,
                }
            }
        };
        self.queue.insert(QueueKey {
            index: id.index,
            ..key
        });
        debug!(request = %name, seq, "request queued");
        self.by_name.insert(name, id);
        Ok(id)
    }

    fn queued(&self, id: RequestId) -> Option<&Queued> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn queued_mut(&mut self, id: RequestId) -> Option<&mut Queued> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn get(&self, id: RequestId) -> Option<&PackRequest> {
        self.queued(id).map(|q| &q.request)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut PackRequest> {
        self.queued_mut(id).map(|q| &mut q.request)
    }

    pub fn top_id(&self) -> Option<RequestId> {
        let key = self.queue.first()?;
        let slot = self.slots.get(key.index as usize)?;
        Some(RequestId {
            index: key.index,
            generation: slot.generation,
        })
    }

    /// Highest priority request; FIFO among equal priorities.
    pub fn top(&self) -> Option<&PackRequest> {
        self.top_id().and_then(|id| self.get(id))
    }

    /// Remove the top request and hand it to the caller.
    pub fn pop(&mut self) -> Option<PackRequest> {
        let id = self.top_id()?;
        self.remove(id).ok()
    }

    /// Reorder a request. Its progress is untouched; it keeps its insertion sequence.
    pub fn set_priority(&mut self, id: RequestId, priority: f32) -> Result<(), SchedulerError> {
        if priority.is_nan() {
            return Err(SchedulerError::InvalidPriority);
        }
        let queued = self.queued_mut(id).ok_or(SchedulerError::NotFound)?;
        let old = QueueKey {
            priority: queued.request.priority(),
            seq: queued.seq,
            index: id.index,
        };
        queued.request.set_priority(priority);
        let new = QueueKey { priority, ..old };
        self.queue.remove(&old);
        self.queue.insert(new);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<RequestId> {
        self.by_name.get(name).copied()
    }

    pub fn is_in_queue(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Take a request out of the queue. Its open stream, if any, is the caller's to close.
    pub fn remove(&mut self, id: RequestId) -> Result<PackRequest, SchedulerError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(SchedulerError::NotFound)?;
        let queued = slot.entry.take().ok_or(SchedulerError::NotFound)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.queue.remove(&QueueKey {
            priority: queued.request.priority(),
            seq: queued.seq,
            index: id.index,
        });
        self.by_name.remove(queued.request.key());
        if self.active == Some(id) {
            self.active = None;
        }
        Ok(queued.request)
    }

    /// Pause the request that last held the transport; it stays queued with its bytes.
    /// Returns its stream for the caller to close.
    pub fn pause_active(&mut self) -> Option<StreamHandle> {
        let id = self.active.take()?;
        let req = self.get_mut(id)?;
        debug!(request = %req.key(), "active request paused");
        req.pause()
    }

    /// Ids of every queued request, in queue order.
    pub fn ids(&self) -> Vec<RequestId> {
        self.queue
            .iter()
            .filter_map(|k| {
                let slot = self.slots.get(k.index as usize)?;
                Some(RequestId {
                    index: k.index,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    /// Queued requests in queue order.
    pub fn iter(&self) -> impl Iterator<Item = (RequestId, &PackRequest)> + '_ {
        self.ids()
            .into_iter()
            .filter_map(move |id| self.get(id).map(|r| (id, r)))
    }

    /// Remove every request, returning them so their streams can be closed.
    pub fn drain(&mut self) -> Vec<PackRequest> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(id).ok())
            .collect()
    }

    /// One tick for the top request. Returns it once it is Ready or Failed.
    pub fn update(&mut self, transport: &mut dyn Transport, codec: &dyn Codec) -> Option<PackRequest> {
        let top = self.top_id()?;
        if let Some(prev) = self.active.filter(|&prev| prev != top) {
            if let Some(req) = self.get_mut(prev) {
                if let Some(handle) = req.pause() {
                    transport.close(handle);
                }
                debug!(request = %req.key(), "preempted");
            }
        }
        self.active = Some(top);

        let resumable = transport.supports_resume();
        let req = self.get_mut(top)?;
        req.set_resumable(resumable);
        req.start();

        let mut open_failed = false;
        if let Some(range) = req.next_window() {
            match transport.open_stream(req.url(), range) {
                Ok(handle) => {
                    debug!(request = %req.key(), offset = range.offset, len = range.len, "window opened");
                    req.attach_stream(handle, range);
                }
                Err(e) => {
                    req.on_transport_error(e);
                    open_failed = true;
                }
            }
        }

        if !open_failed {
            let delivered = match req.stream() {
                Some(handle) => transport.read_available(handle),
                None => Ok(Vec::new()),
            };
            match delivered {
                Ok(bytes) => {
                    req.update(&bytes, codec);
                }
                Err(e) => req.on_transport_error(e),
            }
        }

        if let Some(handle) = req.take_idle_stream() {
            transport.close(handle);
        }

        if req.is_finished() {
            return self.remove(top).ok();
        }
        None
    }
}

/// Synchronous misuse of the scheduler API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("a request named {0} is already queued")]
    DuplicateName(String),
    #[error("no such request")]
    NotFound,
    #[error("priority must be a number")]
    InvalidPriority,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{CompressionMethod, PackWriter};
    use crate::codec::DefaultCodec;
    use crate::config::RetryPolicy;
    use crate::request::{FailureReason, RequestOutput, RequestState};
    use crate::test_support::MemoryTransport;

    fn req(name: &str, priority: f32) -> PackRequest {
        PackRequest::root(name, format!("mem://{name}.pack"), priority, RetryPolicy::default())
    }

    #[test]
    fn top_prefers_priority_then_insertion() {
        let mut m = RequestManager::new();
        m.push(req("alpha", 1.0)).unwrap();
        m.push(req("beta", 5.0)).unwrap();
        m.push(req("gamma", 5.0)).unwrap();
        assert_eq!(m.top().unwrap().key(), "beta");
        assert_eq!(m.pop().unwrap().key(), "beta");
        assert_eq!(m.pop().unwrap().key(), "gamma");
        assert_eq!(m.pop().unwrap().key(), "alpha");
        assert!(m.pop().is_none());
    }

    #[test]
    fn duplicate_and_nan_are_rejected() {
        let mut m = RequestManager::new();
        m.push(req("alpha", 1.0)).unwrap();
        assert_eq!(
            m.push(req("alpha", 2.0)),
            Err(SchedulerError::DuplicateName("alpha".into()))
        );
        assert_eq!(m.push(req("beta", f32::NAN)), Err(SchedulerError::InvalidPriority));
        let id = m.find("alpha").unwrap();
        assert_eq!(m.set_priority(id, f32::NAN), Err(SchedulerError::InvalidPriority));
    }

    #[test]
    fn set_priority_reorders() {
        let mut m = RequestManager::new();
        let a = m.push(req("alpha", 1.0)).unwrap();
        m.push(req("beta", 5.0)).unwrap();
        m.set_priority(a, 9.0).unwrap();
        assert_eq!(m.top().unwrap().key(), "alpha");
        assert_eq!(m.get(a).unwrap().priority(), 9.0);
        m.set_priority(a, 5.0).unwrap();
        // equal priority: alpha was inserted first
        assert_eq!(m.top().unwrap().key(), "alpha");
    }

    #[test]
    fn find_tracks_membership() {
        let mut m = RequestManager::new();
        let a = m.push(req("alpha", 1.0)).unwrap();
        assert!(m.is_in_queue("alpha"));
        assert_eq!(m.find("alpha"), Some(a));
        m.remove(a).unwrap();
        assert!(!m.is_in_queue("alpha"));
        assert_eq!(m.find("alpha"), None);
        assert!(m.is_empty());
    }

    #[test]
    fn stale_id_is_rejected_after_reuse() {
        let mut m = RequestManager::new();
        let a = m.push(req("alpha", 1.0)).unwrap();
        m.remove(a).unwrap();
        let b = m.push(req("beta", 1.0)).unwrap();
        assert_ne!(a, b);
        assert!(m.get(a).is_none());
        assert_eq!(m.remove(a).unwrap_err(), SchedulerError::NotFound);
        assert_eq!(m.set_priority(a, 3.0), Err(SchedulerError::NotFound));
        assert_eq!(m.get(b).unwrap().key(), "beta");
    }

    #[test]
    fn ids_survive_growth() {
        let mut m = RequestManager::new();
        let first = m.push(req("p0", 0.0)).unwrap();
        for i in 1..200 {
            m.push(req(&format!("p{i}"), i as f32)).unwrap();
        }
        assert_eq!(m.get(first).unwrap().key(), "p0");
        assert_eq!(m.top().unwrap().key(), "p199");
        assert_eq!(m.len(), 200);
    }

    fn archive() -> Vec<u8> {
        let mut w = PackWriter::new();
        w.add("hello.txt", b"hello hello hello".to_vec(), CompressionMethod::Lz4);
        w.encode(&DefaultCodec).unwrap()
    }

    #[test]
    fn update_drives_top_to_ready() {
        let mut transport = MemoryTransport::new();
        transport.publish("mem://alpha.pack", archive());
        let mut m = RequestManager::new();
        m.push(req("alpha", 1.0)).unwrap();

        let mut done = None;
        for _ in 0..20 {
            if let Some(r) = m.update(&mut transport, &DefaultCodec) {
                done = Some(r);
                break;
            }
        }
        let mut done = done.expect("request finished");
        assert_eq!(done.state(), &RequestState::Ready);
        assert!(matches!(done.take_output(), Some(RequestOutput::Index(_))));
        assert!(m.is_empty());
        assert_eq!(transport.open_streams(), 0);
    }

    #[test]
    fn preempted_request_keeps_bytes() {
        let mut transport = MemoryTransport::new();
        transport.publish("mem://alpha.pack", archive());
        transport.publish("mem://beta.pack", archive());
        let mut m = RequestManager::new();
        let policy = RetryPolicy {
            chunk_size: 8,
            ..RetryPolicy::default()
        };
        transport.set_burst(4);
        let a = m
            .push(PackRequest::root("alpha", "mem://alpha.pack", 1.0, policy))
            .unwrap();
        assert!(m.update(&mut transport, &DefaultCodec).is_none());
        assert_eq!(m.get(a).unwrap().received(), 4);
        assert_eq!(transport.open_streams(), 1);

        m.push(req("beta", 5.0)).unwrap();
        m.update(&mut transport, &DefaultCodec);
        let alpha = m.get(a).unwrap();
        assert_eq!(alpha.state(), &RequestState::Queued);
        assert_eq!(alpha.received(), 4);
        // alpha's stream was closed, beta's is open
        assert_eq!(transport.open_streams(), 1);
        assert_eq!(m.top().unwrap().key(), "beta");

        m.set_priority(a, 10.0).unwrap();
        m.update(&mut transport, &DefaultCodec);
        let alpha = m.get(a).unwrap();
        assert_eq!(alpha.received(), 8);
        assert_eq!(transport.opened().last().unwrap().1.offset, 4);
    }

    #[test]
    fn missing_resource_fails_after_retries() {
        let mut transport = MemoryTransport::new();
        let mut m = RequestManager::new();
        m.push(req("ghost", 1.0)).unwrap();
        let mut done = None;
        for _ in 0..200 {
            if let Some(r) = m.update(&mut transport, &DefaultCodec) {
                done = Some(r);
                break;
            }
        }
        let done = done.expect("request finished");
        assert!(matches!(
            done.state(),
            RequestState::Failed(FailureReason::Transport(_))
        ));
        assert_eq!(done.attempts(), 3);
    }

    #[test]
    fn pause_active_closes_stream_and_keeps_bytes() {
        let mut transport = MemoryTransport::new();
        transport.publish("mem://alpha.pack", archive());
        transport.set_burst(4);
        let mut m = RequestManager::new();
        let a = m.push(req("alpha", 1.0)).unwrap();
        m.update(&mut transport, &DefaultCodec);

        let handle = m.pause_active().expect("stream open");
        transport.close(handle);
        assert_eq!(transport.open_streams(), 0);
        assert_eq!(m.get(a).unwrap().state(), &RequestState::Queued);
        assert_eq!(m.get(a).unwrap().received(), 4);
        assert_eq!(m.pause_active(), None);

        m.update(&mut transport, &DefaultCodec);
        assert_eq!(transport.opened().last().unwrap().1.offset, 4);
    }

    #[test]
    fn non_resumable_transport_only_sees_offset_zero() {
        let mut transport = MemoryTransport::new();
        transport.publish("mem://alpha.pack", archive());
        transport.set_resumable(false);
        transport.set_burst(5);
        let mut m = RequestManager::new();
        m.push(PackRequest::root(
            "alpha",
            "mem://alpha.pack",
            1.0,
            RetryPolicy {
                chunk_size: 8,
                ..RetryPolicy::default()
            },
        ))
        .unwrap();
        let mut done = None;
        for _ in 0..100 {
            if let Some(r) = m.update(&mut transport, &DefaultCodec) {
                done = Some(r);
                break;
            }
        }
        let done = done.expect("request finished");
        assert_eq!(done.state(), &RequestState::Ready);
        assert_eq!(done.attempts(), 0);
        assert!(transport.opened().iter().all(|(_, r)| r.offset == 0));
    }
}
