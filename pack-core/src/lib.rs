//! On-demand pack delivery core.
//! Host-driven: no I/O; the host supplies a transport, calls `update()` each tick and receives events.

pub mod archive;
pub mod catalog;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod core;
pub mod integrity;
pub mod protocol;
pub mod request;
pub mod scheduler;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use archive::{
    decode_archive, read_index, CompressionMethod, FileTableEntry, FormatError, HeaderInfo,
    PackIndex, PackWriter,
};
pub use catalog::{Catalog, CatalogError, PackDescriptor};
pub use codec::{Codec, CodecError, DefaultCodec};
pub use config::{PackConfig, RetryPolicy};
pub use self::core::{MountedPack, PackError, PackEvent, PackHandle, PackManager, PackStatus};
pub use protocol::{Message, PeerFetch, PeerStep, PROTOCOL_VERSION};
pub use request::{FailureReason, PackRequest, RequestKind, RequestState};
pub use scheduler::{RequestId, RequestManager, SchedulerError};
pub use transport::{ByteRange, StreamHandle, Transport, TransportError};
pub use wire::{decode_frame, encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError};
