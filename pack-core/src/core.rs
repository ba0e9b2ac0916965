//! Host-driven facade: PackManager takes requests from the application, the host calls `update()` each tick.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::archive::{CompressionMethod, HeaderInfo, PackIndex};
use crate::catalog::{Catalog, CatalogError};
use crate::codec::{Codec, DefaultCodec};
use crate::config::PackConfig;
use crate::protocol::{self, Message, PROTOCOL_VERSION};
use crate::request::{entry_key, FailureReason, PackRequest, RequestOutput, RequestState};
use crate::scheduler::{RequestId, RequestManager, SchedulerError};
use crate::transport::Transport;
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Names a requested pack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackHandle(String);

impl PackHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PackStatus {
    Queued,
    Downloading { progress: f32 },
    Verifying,
    Ready,
    Failed(FailureReason),
}

/// Reported by `update()`.
#[derive(Debug, Clone, PartialEq)]
pub enum PackEvent {
    Started { pack: String },
    Progress { pack: String, progress: f32 },
    Mounted { pack: String },
    Failed { pack: String, reason: FailureReason },
    /// Dropped by `remove_pack`; its files are gone from memory.
    Removed { pack: String },
}

/// Decoded content of a mounted pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedPack {
    index: PackIndex,
    files: HashMap<String, Vec<u8>>,
}

impl MountedPack {
    fn empty() -> Self {
        Self {
            index: PackIndex {
                header: HeaderInfo::empty(CompressionMethod::Lz4Hc),
                names: Vec::new(),
                entries: Vec::new(),
            },
            files: HashMap::new(),
        }
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn get(&self, entry: &str) -> Option<&[u8]> {
        self.files.get(entry).map(Vec::as_slice)
    }

    /// Entry names in archive order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug)]
enum Phase {
    /// Waiting for dependencies to mount.
    Parked,
    Metadata,
    Entries {
        index: PackIndex,
        files: HashMap<String, Vec<u8>>,
        remaining: usize,
        done_bytes: u64,
    },
    Mounted,
    Failed(FailureReason),
}

/// Entry content the host already holds, offered before the index arrives.
#[derive(Debug)]
struct LocalEntry {
    /// File-table CRC of the compressed payload it was written from.
    checksum: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
struct PackSlot {
    phase: Phase,
    priority: f32,
    started: bool,
    last_progress: f32,
}

impl PackSlot {
    fn new(phase: Phase, priority: f32) -> Self {
        Self {
            phase,
            priority,
            started: false,
            last_progress: 0.0,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(
            self.phase,
            Phase::Parked | Phase::Metadata | Phase::Entries { .. }
        )
    }
}

/// Main coordinator. Owns the scheduler, the transport and every mounted pack.
pub struct PackManager<T: Transport> {
    config: PackConfig,
    catalog: Catalog,
    transport: T,
    codec: Box<dyn Codec>,
    requests: RequestManager,
    packs: HashMap<String, PackSlot>,
    mounted: HashMap<String, MountedPack>,
    /// Keyed by `entry_key(pack, entry)`.
    local: HashMap<String, LocalEntry>,
    requesting_enabled: bool,
    pending_events: Vec<PackEvent>,
}

impl<T: Transport> PackManager<T> {
    pub fn new(config: PackConfig, catalog: Catalog, transport: T) -> Self {
        Self::with_codec(config, catalog, transport, Box::new(DefaultCodec))
    }

    pub fn with_codec(config: PackConfig, catalog: Catalog, transport: T, codec: Box<dyn Codec>) -> Self {
        Self {
            config,
            catalog,
            transport,
            codec,
            requests: RequestManager::new(),
            packs: HashMap::new(),
            mounted: HashMap::new(),
            local: HashMap::new(),
            requesting_enabled: true,
            pending_events: Vec::new(),
        }
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Ask for a pack (and, first, its dependencies). Re-requesting raises the priority.
    pub fn request_pack(&mut self, name: &str, priority: f32) -> Result<PackHandle, PackError> {
        if priority.is_nan() {
            return Err(SchedulerError::InvalidPriority.into());
        }
        let descriptor = self
            .catalog
            .get(name)
            .cloned()
            .ok_or_else(|| PackError::UnknownPack(name.to_string()))?;
        let handle = PackHandle(name.to_string());

        match self.packs.get(name) {
            Some(slot) if slot.is_pending() => {
                self.raise(name, priority)?;
                return Ok(handle);
            }
            Some(PackSlot {
                phase: Phase::Mounted,
                ..
            }) => return Ok(handle),
            _ => {}
        }

        for dep in &descriptor.dependencies {
            self.request_pack(dep, priority)?;
        }

        if descriptor.is_empty_pack() {
            info!(pack = %name, "empty pack, mounted without transfer");
            self.packs
                .insert(name.to_string(), PackSlot::new(Phase::Mounted, priority));
            self.mounted.insert(name.to_string(), MountedPack::empty());
            self.pending_events.push(PackEvent::Mounted {
                pack: name.to_string(),
            });
            return Ok(handle);
        }

        self.packs
            .insert(name.to_string(), PackSlot::new(Phase::Parked, priority));
        if self.dependencies_mounted(name) {
            self.push_root(name)?;
        } else {
            debug!(pack = %name, "waiting for dependencies");
        }
        Ok(handle)
    }

    /// Drop every queued request of the pack. A mounted pack is left alone.
    pub fn cancel_pack(&mut self, handle: &PackHandle) -> Result<(), PackError> {
        let name = handle.name();
        let slot = self
            .packs
            .get(name)
            .ok_or_else(|| PackError::NotRequested(name.to_string()))?;
        if !slot.is_pending() {
            return Ok(());
        }
        info!(pack = %name, "pack cancelled");
        self.fail_pack(name, FailureReason::Cancelled);
        Ok(())
    }

    /// Forget a pack: drop its requests, unmount it and fail packs still parked on it.
    pub fn remove_pack(&mut self, handle: &PackHandle) -> Result<(), PackError> {
        let name = handle.name();
        if self.packs.remove(name).is_none() {
            return Err(PackError::NotRequested(name.to_string()));
        }
        self.drop_requests(name);
        let was_mounted = self.mounted.remove(name).is_some();
        self.purge_local(name);
        info!(pack = %name, was_mounted, "pack removed");
        self.pending_events.push(PackEvent::Removed {
            pack: name.to_string(),
        });
        self.fail_dependents(name);
        Ok(())
    }

    /// Offer an entry the host already has on disk. Used instead of downloading it
    /// when the pack's file table lists the same checksum and size.
    pub fn add_local_entry(&mut self, pack: &str, entry: &str, checksum: u32, data: Vec<u8>) {
        self.local
            .insert(entry_key(pack, entry), LocalEntry { checksum, data });
    }

    /// Stop or resume all transfers. Disabling pauses the active request and closes its stream;
    /// queued work and received bytes are kept.
    pub fn set_requesting_enabled(&mut self, enabled: bool) {
        if self.requesting_enabled == enabled {
            return;
        }
        self.requesting_enabled = enabled;
        if !enabled {
            if let Some(handle) = self.requests.pause_active() {
                self.transport.close(handle);
            }
        }
        info!(enabled, "requesting toggled");
    }

    pub fn is_requesting_enabled(&self) -> bool {
        self.requesting_enabled
    }

    /// Reprioritize the pack's queued requests; pending dependencies are raised, never lowered.
    pub fn set_priority(&mut self, handle: &PackHandle, priority: f32) -> Result<(), PackError> {
        if priority.is_nan() {
            return Err(SchedulerError::InvalidPriority.into());
        }
        let name = handle.name();
        let slot = self
            .packs
            .get_mut(name)
            .ok_or_else(|| PackError::NotRequested(name.to_string()))?;
        if !slot.is_pending() {
            return Ok(());
        }
        slot.priority = priority;
        for id in self.request_ids(name) {
            self.requests.set_priority(id, priority)?;
        }
        for dep in self.dependencies_of(name) {
            self.raise(&dep, priority)?;
        }
        Ok(())
    }

    pub fn status(&self, handle: &PackHandle) -> Option<PackStatus> {
        let slot = self.packs.get(handle.name())?;
        let status = match &slot.phase {
            Phase::Parked => PackStatus::Queued,
            Phase::Mounted => PackStatus::Ready,
            Phase::Failed(reason) => PackStatus::Failed(reason.clone()),
            Phase::Metadata | Phase::Entries { .. } => {
                let states: Vec<&RequestState> = self
                    .requests
                    .iter()
                    .filter(|(_, r)| r.pack() == handle.name())
                    .map(|(_, r)| r.state())
                    .collect();
                if states.iter().any(|s| **s == RequestState::Verifying) {
                    PackStatus::Verifying
                } else if states
                    .iter()
                    .any(|s| matches!(s, RequestState::Downloading | RequestState::Retrying))
                {
                    PackStatus::Downloading {
                        progress: self.pack_progress(handle.name()),
                    }
                } else {
                    PackStatus::Queued
                }
            }
        };
        Some(status)
    }

    pub fn mounted(&self, name: &str) -> Option<&MountedPack> {
        self.mounted.get(name)
    }

    pub fn read_file(&self, pack: &str, entry: &str) -> Option<&[u8]> {
        self.mounted.get(pack)?.get(entry)
    }

    /// True while any pack is still parked, queued or downloading.
    pub fn has_pending(&self) -> bool {
        self.packs.values().any(PackSlot::is_pending)
    }

    /// One tick: advance the top request and report what changed.
    pub fn update(&mut self) -> Vec<PackEvent> {
        let mut events = std::mem::take(&mut self.pending_events);
        if !self.requesting_enabled {
            return events;
        }

        if let Some(done) = self.requests.update(&mut self.transport, self.codec.as_ref()) {
            self.finish(done, &mut events);
        }

        let top = self
            .requests
            .top()
            .map(|r| (r.pack().to_string(), *r.state() != RequestState::Queued));
        if let Some((pack, active)) = top {
            let progress = self.pack_progress(&pack);
            if let Some(slot) = self.packs.get_mut(&pack) {
                if active && !slot.started {
                    slot.started = true;
                    events.push(PackEvent::Started { pack: pack.clone() });
                }
                if slot.started && progress != slot.last_progress {
                    slot.last_progress = progress;
                    events.push(PackEvent::Progress { pack, progress });
                }
            }
        }
        events
    }

    /// Answer one peer frame at the front of `bytes`: returns the reply frame and bytes consumed.
    pub fn handle_peer_frame(&self, bytes: &[u8]) -> Result<(Vec<u8>, usize), PackError> {
        let (msg, used) = wire::decode_frame::<Message>(bytes)?;
        let Message::ChunkRequest {
            version,
            pack,
            file,
            chunk_index,
        } = msg
        else {
            return Err(PackError::UnexpectedMessage);
        };
        if version != PROTOCOL_VERSION {
            debug!(pack = %pack, file = %file, version, "peer speaks another protocol version");
            let reply = Message::Unavailable { pack, file };
            return Ok((wire::encode_frame(&reply)?, used));
        }
        let reply = protocol::serve_chunk(
            &pack,
            &file,
            self.read_file(&pack, &file),
            chunk_index,
            self.config.chunk_size,
        );
        debug!(pack = %pack, file = %file, chunk_index, "peer chunk served");
        Ok((wire::encode_frame(&reply)?, used))
    }

    /// Close every stream and forget queued work. Mounted packs stay readable.
    pub fn shutdown(&mut self) {
        for mut req in self.requests.drain() {
            if let Some(handle) = req.stop() {
                self.transport.close(handle);
            }
        }
        for slot in self.packs.values_mut() {
            if slot.is_pending() {
                slot.phase = Phase::Failed(FailureReason::Cancelled);
            }
        }
        info!("pack manager shut down");
    }

    fn request_ids(&self, pack: &str) -> Vec<RequestId> {
        self.requests
            .iter()
            .filter(|(_, r)| r.pack() == pack)
            .map(|(id, _)| id)
            .collect()
    }

    fn dependencies_of(&self, pack: &str) -> Vec<String> {
        self.catalog
            .get(pack)
            .map(|d| d.dependencies.clone())
            .unwrap_or_default()
    }

    fn dependencies_mounted(&self, pack: &str) -> bool {
        self.dependencies_of(pack)
            .iter()
            .all(|d| self.mounted.contains_key(d))
    }

    /// Raise a pending pack (and its pending dependencies) to at least `priority`.
    fn raise(&mut self, pack: &str, priority: f32) -> Result<(), PackError> {
        let Some(slot) = self.packs.get_mut(pack) else {
            return Ok(());
        };
        if !slot.is_pending() || slot.priority >= priority {
            return Ok(());
        }
        slot.priority = priority;
        for id in self.request_ids(pack) {
            self.requests.set_priority(id, priority)?;
        }
        for dep in self.dependencies_of(pack) {
            self.raise(&dep, priority)?;
        }
        Ok(())
    }

    fn push_root(&mut self, pack: &str) -> Result<(), PackError> {
        let Some(slot) = self.packs.get_mut(pack) else {
            return Ok(());
        };
        slot.phase = Phase::Metadata;
        let priority = slot.priority;
        let request = PackRequest::root(
            pack,
            self.config.pack_url(pack),
            priority,
            self.config.retry_policy(),
        )
        .with_dependencies(self.dependencies_of(pack));
        self.requests.push(request)?;
        Ok(())
    }

    fn finish(&mut self, mut req: PackRequest, events: &mut Vec<PackEvent>) {
        let pack = req.pack().to_string();
        if let Some(slot) = self.packs.get_mut(&pack) {
            if !slot.started {
                slot.started = true;
                events.push(PackEvent::Started { pack: pack.clone() });
            }
        }
        match req.state().clone() {
            RequestState::Ready => match req.take_output() {
                Some(RequestOutput::Index(index)) => self.on_index(&pack, index),
                Some(RequestOutput::Entry { name, data }) => self.on_entry(&pack, name, data),
                None => self.fail_pack(&pack, FailureReason::Format("request produced nothing".into())),
            },
            RequestState::Failed(reason) => self.fail_pack(&pack, reason),
            _ => {}
        }
        events.append(&mut self.pending_events);
    }

    fn on_index(&mut self, pack: &str, index: PackIndex) {
        if index.is_empty() {
            self.mount(pack, MountedPack::empty());
            return;
        }
        let Some(slot) = self.packs.get_mut(pack) else {
            return;
        };
        let priority = slot.priority;
        let url = self.config.pack_url(pack);
        let policy = self.config.retry_policy();
        let mut files = HashMap::with_capacity(index.len());
        let mut done_bytes = 0;
        let mut pushed = Ok(());
        for (i, (name, record)) in index.names.iter().zip(&index.entries).enumerate() {
            let key = entry_key(pack, name);
            let reusable = self.local.get(&key).is_some_and(|l| {
                l.checksum == record.checksum && l.data.len() == record.original_size as usize
            });
            if reusable {
                if let Some(local) = self.local.remove(&key) {
                    done_bytes += u64::from(record.compressed_size);
                    files.insert(name.clone(), local.data);
                    continue;
                }
            }
            let req = PackRequest::entry(pack, url.clone(), i, name, record, priority, policy);
            if let Err(e) = self.requests.push(req) {
                pushed = Err(e);
                break;
            }
        }
        self.purge_local(pack);
        if let Err(e) = pushed {
            self.fail_pack(pack, FailureReason::Format(e.to_string()));
            return;
        }
        let remaining = index.len() - files.len();
        debug!(pack = %pack, queued = remaining, reused = files.len(), "entry requests queued");
        if remaining == 0 {
            self.mount(pack, MountedPack { index, files });
            return;
        }
        if let Some(slot) = self.packs.get_mut(pack) {
            slot.phase = Phase::Entries {
                remaining,
                files,
                done_bytes,
                index,
            };
        }
    }

    fn on_entry(&mut self, pack: &str, name: String, data: Vec<u8>) {
        let Some(slot) = self.packs.get_mut(pack) else {
            return;
        };
        let Phase::Entries {
            index,
            files,
            remaining,
            done_bytes,
        } = &mut slot.phase
        else {
            return;
        };
        if let Some((_, record)) = index.find(&name).and_then(|i| index.entry(i)) {
            *done_bytes += u64::from(record.compressed_size);
        }
        files.insert(name, data);
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return;
        }
        let mounted = MountedPack {
            index: index.clone(),
            files: std::mem::take(files),
        };
        self.mount(pack, mounted);
    }

    fn mount(&mut self, pack: &str, mounted: MountedPack) {
        info!(pack = %pack, entries = mounted.len(), "pack mounted");
        self.mounted.insert(pack.to_string(), mounted);
        if let Some(slot) = self.packs.get_mut(pack) {
            slot.phase = Phase::Mounted;
            slot.last_progress = 1.0;
        }
        self.pending_events.push(PackEvent::Mounted {
            pack: pack.to_string(),
        });
        self.promote_parked();
    }

    /// Queue the root request of every parked pack whose dependencies are now mounted.
    fn promote_parked(&mut self) {
        let ready: Vec<String> = self
            .packs
            .iter()
            .filter(|(_, s)| matches!(s.phase, Phase::Parked))
            .map(|(name, _)| name.clone())
            .filter(|name| self.dependencies_mounted(name))
            .collect();
        for name in ready {
            if let Err(e) = self.push_root(&name) {
                self.fail_pack(&name, FailureReason::Format(e.to_string()));
            }
        }
    }

    fn fail_pack(&mut self, pack: &str, reason: FailureReason) {
        self.drop_requests(pack);
        if let Some(slot) = self.packs.get_mut(pack) {
            slot.phase = Phase::Failed(reason.clone());
        }
        warn!(pack = %pack, reason = %reason, "pack failed");
        self.pending_events.push(PackEvent::Failed {
            pack: pack.to_string(),
            reason,
        });
        self.fail_dependents(pack);
    }

    fn drop_requests(&mut self, pack: &str) {
        for id in self.request_ids(pack) {
            if let Ok(mut req) = self.requests.remove(id) {
                if let Some(handle) = req.stop() {
                    self.transport.close(handle);
                }
            }
        }
    }

    fn purge_local(&mut self, pack: &str) {
        let prefix = entry_key(pack, "");
        self.local.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Parked packs can never start once `pack` is gone.
    fn fail_dependents(&mut self, pack: &str) {
        let dependents: Vec<String> = self
            .packs
            .iter()
            .filter(|(_, s)| matches!(s.phase, Phase::Parked))
            .map(|(name, _)| name.clone())
            .filter(|name| self.dependencies_of(name).iter().any(|d| d == pack))
            .collect();
        for name in dependents {
            self.fail_pack(&name, FailureReason::Dependency(pack.to_string()));
        }
    }

    fn pack_progress(&self, pack: &str) -> f32 {
        let Some(slot) = self.packs.get(pack) else {
            return 0.0;
        };
        match &slot.phase {
            Phase::Mounted => 1.0,
            Phase::Entries {
                index, done_bytes, ..
            } => {
                let in_flight: u64 = self
                    .requests
                    .iter()
                    .filter(|(_, r)| r.pack() == pack)
                    .map(|(_, r)| r.received())
                    .sum();
                let done = index.header.metadata_len() + done_bytes + in_flight;
                let total = index.total_len().max(1);
                (done as f64 / total as f64).min(1.0) as f32
            }
            Phase::Parked | Phase::Metadata | Phase::Failed(_) => 0.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("unknown pack {0}")]
    UnknownPack(String),
    #[error("pack {0} was never requested")]
    NotRequested(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("peer frame: {0}")]
    FrameDecode(#[from] FrameDecodeError),
    #[error("peer frame: {0}")]
    FrameEncode(#[from] FrameEncodeError),
    #[error("unexpected peer message")]
    UnexpectedMessage,
}
