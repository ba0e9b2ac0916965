//! Framing for peer messages: 4-byte LE length prefix + bincode payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

const LEN_SIZE: usize = 4;
/// Largest payload accepted in either direction; a window plus names fits comfortably.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode one message as a frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode the frame at the front of `bytes`; returns the message and bytes consumed.
/// `NeedMore` means the frame is incomplete, not that it is bad.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    let Some(prefix) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len as usize));
    }
    let end = LEN_SIZE + len as usize;
    let Some(payload) = bytes.get(LEN_SIZE..end) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let msg = bincode::deserialize(payload)?;
    Ok((msg, end))
}

/// Accumulates stream bytes and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameDecodeError> {
        match decode_frame(&self.buf) {
            Ok((msg, used)) => {
                self.buf.drain(..used);
                Ok(Some(msg))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn sample() -> Message {
        Message::ChunkData {
            pack: "base".into(),
            file: "textures/grass.dds".into(),
            chunk_index: 2,
            chunk_count: 5,
            checksum: 0xCBF4_3926,
            payload: b"123456789".to_vec(),
        }
    }

    #[test]
    fn roundtrip_chunk_data() {
        let frame = encode_frame(&sample()).unwrap();
        let (decoded, n): (Message, usize) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, sample());
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample()).unwrap();
        assert!(matches!(
            decode_frame::<Message>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<Message>(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut frame = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&[0; 8]);
        assert!(matches!(
            decode_frame::<Message>(&frame),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn buffer_yields_frames_across_pushes() {
        let a = Message::chunk_request("base", "a", 0);
        let b = sample();
        let mut bytes = encode_frame(&a).unwrap();
        bytes.extend(encode_frame(&b).unwrap());

        let mut fb = FrameBuffer::new();
        let (head, tail) = bytes.split_at(7);
        fb.push(head);
        assert_eq!(fb.next_frame::<Message>().unwrap(), None);
        fb.push(tail);
        assert_eq!(fb.next_frame::<Message>().unwrap(), Some(a));
        assert_eq!(fb.next_frame::<Message>().unwrap(), Some(b));
        assert_eq!(fb.next_frame::<Message>().unwrap(), None);
        assert_eq!(fb.pending(), 0);
    }
}
