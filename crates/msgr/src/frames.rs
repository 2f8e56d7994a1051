// Frame layout on the wire (all integers little-endian):
//
//   u32 payload_len
//   u16 tag
//   u64 tid
//   [payload_len bytes] payload
//   u32 crc32c(tag || tid || payload)
//
// The tid ties a reply to its request; notifications pushed on a subscribed
// connection carry tid 0.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const FRAME_LEN_SIZE: usize = 4;
pub const FRAME_TAG_SIZE: usize = 2;
pub const FRAME_TID_SIZE: usize = 8;
pub const FRAME_HEADER_SIZE: usize = FRAME_LEN_SIZE + FRAME_TAG_SIZE + FRAME_TID_SIZE;
pub const FRAME_CRC_SIZE: usize = 4;

/// Largest payload a single frame may carry (1 GiB)
pub const MAX_FRAME_PAYLOAD: usize = 1 << 30;

/// Message tags
///
/// Requests are odd, their replies the following even value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u16)]
pub enum Tag {
    CreateRequest = 1,
    CreateReply = 2,
    SealRequest = 3,
    SealReply = 4,
    GetRequest = 5,
    GetReply = 6,
    ReleaseRequest = 7,
    ReleaseReply = 8,
    DeleteRequest = 9,
    DeleteReply = 10,
    ContainsRequest = 11,
    ContainsReply = 12,
    EvictRequest = 13,
    EvictReply = 14,
    SubscribeRequest = 15,
    SubscribeReply = 16,
    FetchRequest = 17,
    FetchReply = 18,
    TransferRequest = 19,
    TransferReply = 20,
    WaitRequest = 21,
    WaitReply = 22,
    DisconnectRequest = 23,
    DisconnectReply = 24,
    Error = 100,
    Notification = 101,
}

impl Tag {
    pub fn as_u16(self) -> u16 {
        self.into()
    }

    pub fn is_request(self) -> bool {
        let raw = self.as_u16();
        raw < 100 && raw % 2 == 1
    }
}

/// One unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub tid: u64,
    pub payload: Bytes,
}

fn frame_crc(tag: u16, tid: u64, payload: &[u8]) -> u32 {
    let mut head = [0u8; FRAME_TAG_SIZE + FRAME_TID_SIZE];
    head[..FRAME_TAG_SIZE].copy_from_slice(&tag.to_le_bytes());
    head[FRAME_TAG_SIZE..].copy_from_slice(&tid.to_le_bytes());
    let crc = crc32c::crc32c(&head);
    crc32c::crc32c_append(crc, payload)
}

impl Frame {
    pub fn new(tag: Tag, tid: u64, payload: Bytes) -> Self {
        Self { tag, tid, payload }
    }

    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + FRAME_CRC_SIZE
    }

    /// Append the encoded frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::FrameTooLarge(self.payload.len()));
        }
        let tag = self.tag.as_u16();
        dst.reserve(self.wire_size());
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_u16_le(tag);
        dst.put_u64_le(self.tid);
        dst.put_slice(&self.payload);
        dst.put_u32_le(frame_crc(tag, self.tid, &self.payload));
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Try to take one complete frame off the front of `src`
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a whole frame; the
    /// buffer is left untouched in that case.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(Error::FrameTooLarge(len));
        }
        if src.len() < FRAME_HEADER_SIZE + len + FRAME_CRC_SIZE {
            return Ok(None);
        }

        src.advance(FRAME_LEN_SIZE);
        let raw_tag = src.get_u16_le();
        let tid = src.get_u64_le();
        let payload = src.split_to(len).freeze();
        let actual = src.get_u32_le();

        let expected = frame_crc(raw_tag, tid, &payload);
        if actual != expected {
            return Err(Error::BadCrc { expected, actual });
        }
        let tag = Tag::try_from(raw_tag).map_err(|_| Error::UnknownTag(raw_tag))?;
        Ok(Some(Frame { tag, tid, payload }))
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
