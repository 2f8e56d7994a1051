//! Object lifecycle notifications
//!
//! `ObjectInfo` is the self-describing record pushed on a notification
//! channel; `NotificationEvent` is what subscribers consume. A deletion is
//! reported with the `(-1, -1)` size sentinel pair.

use crate::denc::{Denc, VersionedEncode};
use crate::error::DencError;
use crate::impl_denc_for_versioned;
use crate::types::{ObjectId, OBJECT_ID_SIZE};
use bytes::{Buf, BufMut};
use serde::Serialize;

/// Size reported for both regions of a deleted object
pub const DELETED_SIZE: i64 = -1;

/// A lifecycle event delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    pub object_id: ObjectId,
    pub data_size: i64,
    pub metadata_size: i64,
}

impl NotificationEvent {
    /// An object was sealed and is available
    pub fn sealed(object_id: ObjectId, data_size: u64, metadata_size: u64) -> Self {
        Self {
            object_id,
            data_size: data_size as i64,
            metadata_size: metadata_size as i64,
        }
    }

    /// An object was deleted
    pub fn deleted(object_id: ObjectId) -> Self {
        Self {
            object_id,
            data_size: DELETED_SIZE,
            metadata_size: DELETED_SIZE,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.data_size == DELETED_SIZE && self.metadata_size == DELETED_SIZE
    }
}

/// Wire record for a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub object_id: ObjectId,
    pub is_deletion: bool,
    pub data_size: i64,
    pub metadata_size: i64,
}

impl From<NotificationEvent> for ObjectInfo {
    fn from(event: NotificationEvent) -> Self {
        Self {
            object_id: event.object_id,
            is_deletion: event.is_deletion(),
            data_size: event.data_size,
            metadata_size: event.metadata_size,
        }
    }
}

impl TryFrom<ObjectInfo> for NotificationEvent {
    type Error = DencError;

    fn try_from(info: ObjectInfo) -> Result<Self, Self::Error> {
        if info.is_deletion {
            // Sizes of a deletion record carry no information
            return Ok(NotificationEvent::deleted(info.object_id));
        }
        if info.data_size < 0 || info.metadata_size < 0 {
            return Err(DencError::InvalidData(format!(
                "Sealed notification for {} has negative sizes ({}, {})",
                info.object_id, info.data_size, info.metadata_size
            )));
        }
        Ok(NotificationEvent {
            object_id: info.object_id,
            data_size: info.data_size,
            metadata_size: info.metadata_size,
        })
    }
}

impl VersionedEncode for ObjectInfo {
    const MAX_SUPPORTED_VERSION: u8 = 1;

    fn encoding_version(&self) -> u8 {
        1
    }

    fn compat_version(&self) -> u8 {
        1
    }

    fn encode_content<B: BufMut>(&self, buf: &mut B, _version: u8) -> Result<(), DencError> {
        self.object_id.encode(buf)?;
        self.is_deletion.encode(buf)?;
        self.data_size.encode(buf)?;
        self.metadata_size.encode(buf)?;
        Ok(())
    }

    fn decode_content<B: Buf>(buf: &mut B, _version: u8) -> Result<Self, DencError> {
        let object_id = ObjectId::decode(buf)?;
        let is_deletion = bool::decode(buf)?;
        let data_size = i64::decode(buf)?;
        let metadata_size = i64::decode(buf)?;
        Ok(Self {
            object_id,
            is_deletion,
            data_size,
            metadata_size,
        })
    }

    fn encoded_size_content(&self, _version: u8) -> Option<usize> {
        Some(OBJECT_ID_SIZE + 1 + 8 + 8)
    }
}

impl_denc_for_versioned!(ObjectInfo);
