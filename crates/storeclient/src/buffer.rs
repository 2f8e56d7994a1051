//! Object buffers handed to callers
//!
//! A [`BufferView`] is a read-only view of a sealed object; the bytes are
//! shared with the store, so cloning a view copies nothing. A
//! [`MutableBuffer`] is the writable data region of an object this client
//! is creating. It is consumed by sealing, so the region cannot be written
//! once the object is immutable.

use bytes::{Bytes, BytesMut};
use denc::{Digest, ObjectId};
use msgr::ObjectPayload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

/// Unsealed regions whose buffer was dropped before sealing, kept so the
/// object can still be sealed by id
pub(crate) type ParkedRegions = Arc<Mutex<HashMap<ObjectId, BytesMut>>>;

#[derive(Debug, Clone)]
pub struct BufferView {
    object_id: ObjectId,
    data: Bytes,
    metadata: Bytes,
}

impl BufferView {
    pub(crate) fn new(object_id: ObjectId, payload: ObjectPayload) -> Self {
        Self {
            object_id,
            data: payload.data,
            metadata: payload.metadata,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn metadata_size(&self) -> usize {
        self.metadata.len()
    }

    pub fn digest(&self) -> Digest {
        Digest::compute(&self.data, &self.metadata)
    }
}

impl Deref for BufferView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug)]
pub struct MutableBuffer {
    object_id: ObjectId,
    data: Option<BytesMut>,
    metadata: Bytes,
    parked: Weak<Mutex<HashMap<ObjectId, BytesMut>>>,
}

impl MutableBuffer {
    pub(crate) fn new(
        object_id: ObjectId,
        data_size: usize,
        metadata: Bytes,
        parked: &ParkedRegions,
    ) -> Self {
        Self {
            object_id,
            data: Some(BytesMut::zeroed(data_size)),
            metadata,
            parked: Arc::downgrade(parked),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    /// Give up the region; the caller is about to seal it
    pub(crate) fn into_data(mut self) -> Bytes {
        self.data.take().map(BytesMut::freeze).unwrap_or_default()
    }
}

impl Deref for MutableBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

impl DerefMut for MutableBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for MutableBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(parked)) = (self.data.take(), self.parked.upgrade()) {
            parked.lock().insert(self.object_id, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_writes_reach_sealed_bytes() {
        let parked = ParkedRegions::default();
        let id = ObjectId::new([3; 20]);
        let mut buffer = MutableBuffer::new(id, 4, Bytes::from_static(b"m"), &parked);
        assert_eq!(&buffer[..], &[0, 0, 0, 0]);
        buffer.copy_from_slice(b"abcd");

        let data = buffer.into_data();
        assert_eq!(&data[..], b"abcd");
        // Consumed buffers are not parked
        assert!(parked.lock().is_empty());
    }

    #[test]
    fn test_dropped_buffer_is_parked() {
        let parked = ParkedRegions::default();
        let id = ObjectId::new([4; 20]);
        let mut buffer = MutableBuffer::new(id, 2, Bytes::new(), &parked);
        buffer[0] = 9;
        drop(buffer);
        assert_eq!(&parked.lock().get(&id).unwrap()[..], &[9, 0]);
    }

    #[test]
    fn test_view_exposes_both_regions() {
        let view = BufferView::new(
            ObjectId::new([5; 20]),
            ObjectPayload {
                data: Bytes::from_static(b"data"),
                metadata: Bytes::from_static(b"meta"),
            },
        );
        assert_eq!(view.data_size(), 4);
        assert_eq!(&view[..2], b"da");
        assert_eq!(view.metadata(), &Bytes::from_static(b"meta"));
        assert_eq!(view.digest(), Digest::compute(b"data", b"meta"));
    }
}
