//! Message catalogue
//!
//! Every request a client can send, the reply the store or manager answers
//! with, and the notification record pushed on a subscribed connection.
//! Each message travels as the payload of one [`Frame`] whose tag names the
//! message type.

use crate::error::{Error, Result};
use crate::frames::{Frame, Tag};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use denc::{Denc, DencError, ObjectId, ObjectInfo};
use std::time::Duration;

/// Wire value for "wait forever"
pub const INFINITE_TIMEOUT_MS: i64 = -1;

/// Largest timeout a Wait request may carry
pub const WAIT_TIMEOUT_CEILING_MS: u64 = 1 << 30;

/// Convert an optional timeout to wire milliseconds (`None` is infinite)
pub fn timeout_to_wire(timeout: Option<Duration>) -> i64 {
    match timeout {
        None => INFINITE_TIMEOUT_MS,
        Some(d) => d.as_millis().min(i64::MAX as u128) as i64,
    }
}

/// Convert wire milliseconds back; any negative value means infinite
pub fn timeout_from_wire(ms: i64) -> Option<Duration> {
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

macro_rules! impl_denc_for_enum {
    ($ty:ty, $repr:ty) => {
        impl Denc for $ty {
            fn encode<B: BufMut>(&self, buf: &mut B) -> std::result::Result<(), DencError> {
                <$repr>::from(*self).encode(buf)
            }

            fn decode<B: Buf>(buf: &mut B) -> std::result::Result<Self, DencError> {
                let raw = <$repr>::decode(buf)?;
                <$ty>::try_from(raw).map_err(|_| {
                    DencError::InvalidData(format!(
                        "Invalid {} value: {}",
                        stringify!($ty),
                        raw
                    ))
                })
            }

            fn encoded_size(&self) -> Option<usize> {
                Some(std::mem::size_of::<$repr>())
            }
        }
    };
}

/// Where an object is known to live, as answered by the manager
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum ObjectStatus {
    Nonexistent = 0,
    Local = 1,
    Remote = 2,
}

impl ObjectStatus {
    /// Local and Remote objects count toward a Wait's ready set
    pub fn is_available(self) -> bool {
        matches!(self, ObjectStatus::Local | ObjectStatus::Remote)
    }
}

/// Scope of a Wait query
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum QueryType {
    Local = 1,
    Anywhere = 2,
}

/// Failure classes a store or manager can reply with
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u16)]
pub enum ErrorCode {
    ObjectExists = 1,
    StoreFull = 2,
    ObjectNotFound = 3,
    NotConnected = 4,
    ContractViolation = 5,
    Internal = 6,
}

impl_denc_for_enum!(ObjectStatus, u8);
impl_denc_for_enum!(QueryType, u8);
impl_denc_for_enum!(ErrorCode, u16);

/// One entry of a Wait request; the reply fills in `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRequest {
    pub object_id: ObjectId,
    pub query: QueryType,
    pub status: ObjectStatus,
}

impl ObjectRequest {
    pub fn anywhere(object_id: ObjectId) -> Self {
        Self {
            object_id,
            query: QueryType::Anywhere,
            status: ObjectStatus::Nonexistent,
        }
    }

    pub fn local(object_id: ObjectId) -> Self {
        Self {
            object_id,
            query: QueryType::Local,
            status: ObjectStatus::Nonexistent,
        }
    }
}

impl Denc for ObjectRequest {
    fn encode<B: BufMut>(&self, buf: &mut B) -> std::result::Result<(), DencError> {
        self.object_id.encode(buf)?;
        self.query.encode(buf)?;
        self.status.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> std::result::Result<Self, DencError> {
        Ok(Self {
            object_id: ObjectId::decode(buf)?,
            query: QueryType::decode(buf)?,
            status: ObjectStatus::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(denc::OBJECT_ID_SIZE + 2)
    }
}

/// The regions of a sealed object as carried in a Get reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPayload {
    pub data: Bytes,
    pub metadata: Bytes,
}

impl Denc for ObjectPayload {
    fn encode<B: BufMut>(&self, buf: &mut B) -> std::result::Result<(), DencError> {
        self.data.encode(buf)?;
        self.metadata.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> std::result::Result<Self, DencError> {
        Ok(Self {
            data: Bytes::decode(buf)?,
            metadata: Bytes::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(8 + self.data.len() + self.metadata.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Requests sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Reserve an object; the writable region lives with the client until Seal
    Create {
        object_id: ObjectId,
        data_size: u64,
        metadata: Bytes,
    },
    /// Freeze an object, handing over its written data region
    Seal { object_id: ObjectId, data: Bytes },
    Get {
        object_ids: Vec<ObjectId>,
        timeout_ms: i64,
    },
    Release { object_id: ObjectId },
    Delete { object_id: ObjectId },
    Contains { object_id: ObjectId },
    Evict { num_bytes: u64 },
    /// Turn this connection into a notification channel
    Subscribe,
    Fetch { object_ids: Vec<ObjectId> },
    Transfer {
        address: String,
        port: u16,
        object_id: ObjectId,
    },
    Wait {
        requests: Vec<ObjectRequest>,
        num_ready: u32,
        timeout_ms: i64,
    },
    Disconnect,
}

impl Request {
    pub fn tag(&self) -> Tag {
        match self {
            Request::Create { .. } => Tag::CreateRequest,
            Request::Seal { .. } => Tag::SealRequest,
            Request::Get { .. } => Tag::GetRequest,
            Request::Release { .. } => Tag::ReleaseRequest,
            Request::Delete { .. } => Tag::DeleteRequest,
            Request::Contains { .. } => Tag::ContainsRequest,
            Request::Evict { .. } => Tag::EvictRequest,
            Request::Subscribe => Tag::SubscribeRequest,
            Request::Fetch { .. } => Tag::FetchRequest,
            Request::Transfer { .. } => Tag::TransferRequest,
            Request::Wait { .. } => Tag::WaitRequest,
            Request::Disconnect => Tag::DisconnectRequest,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::Seal { .. } => "seal",
            Request::Get { .. } => "get",
            Request::Release { .. } => "release",
            Request::Delete { .. } => "delete",
            Request::Contains { .. } => "contains",
            Request::Evict { .. } => "evict",
            Request::Subscribe => "subscribe",
            Request::Fetch { .. } => "fetch",
            Request::Transfer { .. } => "transfer",
            Request::Wait { .. } => "wait",
            Request::Disconnect => "disconnect",
        }
    }

    /// Whether sending the request again is harmless when the first
    /// attempt's outcome is unknown
    ///
    /// A repeated Create reports `ObjectExists`, a repeated Seal is rejected
    /// and a repeated Release drops a reference the caller no longer holds.
    pub fn is_retry_safe(&self) -> bool {
        !matches!(
            self,
            Request::Create { .. } | Request::Seal { .. } | Request::Release { .. }
        )
    }

    /// Requests handled by the manager rather than the store
    pub fn is_manager_request(&self) -> bool {
        matches!(
            self,
            Request::Fetch { .. } | Request::Transfer { .. } | Request::Wait { .. }
        )
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Request::Create {
                object_id,
                data_size,
                metadata,
            } => {
                object_id.encode(buf)?;
                data_size.encode(buf)?;
                metadata.encode(buf)?;
            }
            Request::Seal { object_id, data } => {
                object_id.encode(buf)?;
                data.encode(buf)?;
            }
            Request::Get {
                object_ids,
                timeout_ms,
            } => {
                object_ids.encode(buf)?;
                timeout_ms.encode(buf)?;
            }
            Request::Release { object_id }
            | Request::Delete { object_id }
            | Request::Contains { object_id } => object_id.encode(buf)?,
            Request::Evict { num_bytes } => num_bytes.encode(buf)?,
            Request::Subscribe | Request::Disconnect => {}
            Request::Fetch { object_ids } => object_ids.encode(buf)?,
            Request::Transfer {
                address,
                port,
                object_id,
            } => {
                address.encode(buf)?;
                port.encode(buf)?;
                object_id.encode(buf)?;
            }
            Request::Wait {
                requests,
                num_ready,
                timeout_ms,
            } => {
                requests.encode(buf)?;
                num_ready.encode(buf)?;
                timeout_ms.encode(buf)?;
            }
        }
        Ok(())
    }

    fn decode_payload(tag: Tag, buf: &mut Bytes) -> Result<Self> {
        let request = match tag {
            Tag::CreateRequest => Request::Create {
                object_id: ObjectId::decode(buf)?,
                data_size: u64::decode(buf)?,
                metadata: Bytes::decode(buf)?,
            },
            Tag::SealRequest => Request::Seal {
                object_id: ObjectId::decode(buf)?,
                data: Bytes::decode(buf)?,
            },
            Tag::GetRequest => Request::Get {
                object_ids: Vec::decode(buf)?,
                timeout_ms: i64::decode(buf)?,
            },
            Tag::ReleaseRequest => Request::Release {
                object_id: ObjectId::decode(buf)?,
            },
            Tag::DeleteRequest => Request::Delete {
                object_id: ObjectId::decode(buf)?,
            },
            Tag::ContainsRequest => Request::Contains {
                object_id: ObjectId::decode(buf)?,
            },
            Tag::EvictRequest => Request::Evict {
                num_bytes: u64::decode(buf)?,
            },
            Tag::SubscribeRequest => Request::Subscribe,
            Tag::FetchRequest => Request::Fetch {
                object_ids: Vec::decode(buf)?,
            },
            Tag::TransferRequest => Request::Transfer {
                address: String::decode(buf)?,
                port: u16::decode(buf)?,
                object_id: ObjectId::decode(buf)?,
            },
            Tag::WaitRequest => Request::Wait {
                requests: Vec::decode(buf)?,
                num_ready: u32::decode(buf)?,
                timeout_ms: i64::decode(buf)?,
            },
            Tag::DisconnectRequest => Request::Disconnect,
            other => {
                return Err(Error::Protocol(format!(
                    "Frame tag {:?} is not a request",
                    other
                )))
            }
        };
        Ok(request)
    }

    pub fn to_frame(&self, tid: u64) -> Result<Frame> {
        let mut buf = BytesMut::new();
        self.encode_payload(&mut buf)?;
        Ok(Frame::new(self.tag(), tid, buf.freeze()))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut payload = frame.payload.clone();
        let request = Self::decode_payload(frame.tag, &mut payload)?;
        expect_consumed(&payload, frame.tag)?;
        Ok(request)
    }
}

/// Replies sent by the store or manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Create,
    Seal,
    /// One entry per requested id, in request order
    Get { objects: Vec<Option<ObjectPayload>> },
    Release,
    Delete,
    Contains { present: bool },
    Evict { freed: u64 },
    Subscribe,
    Fetch,
    Transfer,
    Wait { requests: Vec<ObjectRequest> },
    Disconnect,
    Error(ErrorReply),
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error(ErrorReply::new(code, message))
    }

    pub fn tag(&self) -> Tag {
        match self {
            Response::Create => Tag::CreateReply,
            Response::Seal => Tag::SealReply,
            Response::Get { .. } => Tag::GetReply,
            Response::Release => Tag::ReleaseReply,
            Response::Delete => Tag::DeleteReply,
            Response::Contains { .. } => Tag::ContainsReply,
            Response::Evict { .. } => Tag::EvictReply,
            Response::Subscribe => Tag::SubscribeReply,
            Response::Fetch => Tag::FetchReply,
            Response::Transfer => Tag::TransferReply,
            Response::Wait { .. } => Tag::WaitReply,
            Response::Disconnect => Tag::DisconnectReply,
            Response::Error(_) => Tag::Error,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Response::Get { objects } => objects.encode(buf)?,
            Response::Contains { present } => present.encode(buf)?,
            Response::Evict { freed } => freed.encode(buf)?,
            Response::Wait { requests } => requests.encode(buf)?,
            Response::Error(reply) => {
                reply.code.encode(buf)?;
                reply.message.encode(buf)?;
            }
            Response::Create
            | Response::Seal
            | Response::Release
            | Response::Delete
            | Response::Subscribe
            | Response::Fetch
            | Response::Transfer
            | Response::Disconnect => {}
        }
        Ok(())
    }

    fn decode_payload(tag: Tag, buf: &mut Bytes) -> Result<Self> {
        let response = match tag {
            Tag::CreateReply => Response::Create,
            Tag::SealReply => Response::Seal,
            Tag::GetReply => Response::Get {
                objects: Vec::decode(buf)?,
            },
            Tag::ReleaseReply => Response::Release,
            Tag::DeleteReply => Response::Delete,
            Tag::ContainsReply => Response::Contains {
                present: bool::decode(buf)?,
            },
            Tag::EvictReply => Response::Evict {
                freed: u64::decode(buf)?,
            },
            Tag::SubscribeReply => Response::Subscribe,
            Tag::FetchReply => Response::Fetch,
            Tag::TransferReply => Response::Transfer,
            Tag::WaitReply => Response::Wait {
                requests: Vec::decode(buf)?,
            },
            Tag::DisconnectReply => Response::Disconnect,
            Tag::Error => Response::Error(ErrorReply {
                code: ErrorCode::decode(buf)?,
                message: String::decode(buf)?,
            }),
            other => {
                return Err(Error::Protocol(format!(
                    "Frame tag {:?} is not a reply",
                    other
                )))
            }
        };
        Ok(response)
    }

    pub fn to_frame(&self, tid: u64) -> Result<Frame> {
        let mut buf = BytesMut::new();
        self.encode_payload(&mut buf)?;
        Ok(Frame::new(self.tag(), tid, buf.freeze()))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut payload = frame.payload.clone();
        let response = Self::decode_payload(frame.tag, &mut payload)?;
        expect_consumed(&payload, frame.tag)?;
        Ok(response)
    }
}

/// Wrap a notification record in a frame (tid 0)
pub fn notification_frame(info: &ObjectInfo) -> Result<Frame> {
    let payload = denc::encode_to_bytes(info)?;
    Ok(Frame::new(Tag::Notification, 0, payload))
}

/// Decode the notification record carried by `frame`
pub fn decode_notification(frame: &Frame) -> Result<ObjectInfo> {
    if frame.tag != Tag::Notification {
        return Err(Error::Protocol(format!(
            "Expected notification frame, got {:?}",
            frame.tag
        )));
    }
    let mut payload = frame.payload.clone();
    Ok(denc::decode_exact(&mut payload)?)
}

fn expect_consumed(rest: &Bytes, tag: Tag) -> Result<()> {
    if rest.has_remaining() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after {:?} payload",
            rest.remaining(),
            tag
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use denc::NotificationEvent;

    fn id(b: u8) -> ObjectId {
        ObjectId::new([b; denc::OBJECT_ID_SIZE])
    }

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_to_wire(None), -1);
        assert_eq!(timeout_to_wire(Some(Duration::from_millis(250))), 250);
        assert_eq!(timeout_from_wire(-1), None);
        assert_eq!(timeout_from_wire(-7), None);
        assert_eq!(timeout_from_wire(0), Some(Duration::ZERO));
    }

    #[test]
    fn test_request_frames() {
        let requests = vec![
            Request::Create {
                object_id: id(1),
                data_size: 100,
                metadata: Bytes::from_static(b"m"),
            },
            Request::Get {
                object_ids: vec![id(1), id(2)],
                timeout_ms: -1,
            },
            Request::Transfer {
                address: "10.0.0.2".into(),
                port: 23894,
                object_id: id(3),
            },
            Request::Wait {
                requests: vec![ObjectRequest::anywhere(id(4))],
                num_ready: 1,
                timeout_ms: 500,
            },
            Request::Subscribe,
        ];
        for (tid, request) in requests.into_iter().enumerate() {
            let frame = request.to_frame(tid as u64).unwrap();
            assert_eq!(frame.tid, tid as u64);
            assert!(frame.tag.is_request());
            assert_eq!(Request::from_frame(&frame).unwrap(), request);
        }
    }

    #[test]
    fn test_get_reply_keeps_holes() {
        let response = Response::Get {
            objects: vec![
                Some(ObjectPayload {
                    data: Bytes::from_static(b"abc"),
                    metadata: Bytes::new(),
                }),
                None,
            ],
        };
        let frame = response.to_frame(9).unwrap();
        assert_eq!(Response::from_frame(&frame).unwrap(), response);
    }

    #[test]
    fn test_error_reply() {
        let response = Response::error(ErrorCode::StoreFull, "no room");
        let frame = response.to_frame(1).unwrap();
        assert_eq!(frame.tag, Tag::Error);
        match Response::from_frame(&frame).unwrap() {
            Response::Error(reply) => {
                assert_eq!(reply.code, ErrorCode::StoreFull);
                assert_eq!(reply.message, "no room");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reply_tag_is_not_a_request() {
        let frame = Response::Seal.to_frame(1).unwrap();
        assert!(Request::from_frame(&frame).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = Request::Release { object_id: id(1) }.to_frame(1).unwrap();
        let mut payload = BytesMut::from(&frame.payload[..]);
        payload.put_u8(0);
        frame.payload = payload.freeze();
        assert!(Request::from_frame(&frame).is_err());
    }

    #[test]
    fn test_invalid_status_rejected() {
        let mut buf = BytesMut::new();
        id(1).encode(&mut buf).unwrap();
        buf.put_u8(QueryType::Anywhere.into());
        buf.put_u8(9);
        assert!(ObjectRequest::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_notification_frame() {
        let info = ObjectInfo::from(NotificationEvent::deleted(id(5)));
        let frame = notification_frame(&info).unwrap();
        assert_eq!(frame.tid, 0);
        assert_eq!(decode_notification(&frame).unwrap(), info);

        let not_a_notification = Response::Seal.to_frame(0).unwrap();
        assert!(decode_notification(&not_a_notification).is_err());
    }

    #[test]
    fn test_availability() {
        assert!(ObjectStatus::Local.is_available());
        assert!(ObjectStatus::Remote.is_available());
        assert!(!ObjectStatus::Nonexistent.is_available());
    }
}
