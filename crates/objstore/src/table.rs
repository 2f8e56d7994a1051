//! Object table
//!
//! Records live in a slot arena indexed by object id. A removed record frees
//! its slot for reuse and its id for a new incarnation; nothing outside the
//! table holds a pointer to a record.

use bytes::Bytes;
use denc::{Digest, ObjectId};
use msgr::ObjectPayload;
use std::collections::HashMap;

/// Identifies one connected client of a store
pub type ClientId = u64;

/// Lifecycle state of a live record
///
/// Nonexistent and Deleted are represented by the absence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Creating,
    Sealed,
}

#[derive(Debug)]
pub struct ObjectRecord {
    pub object_id: ObjectId,
    pub state: ObjectState,
    pub data_size: u64,
    pub metadata: Bytes,
    /// Empty until sealed
    pub data: Bytes,
    pub creator: ClientId,
    /// LRU clock value of the last create, seal, get or release
    pub last_access: u64,
    /// Sequence number of the seal, used to replay events in seal order
    pub sealed_seq: u64,
    /// Delete was requested while references were outstanding
    pub delete_pending: bool,
    holders: HashMap<ClientId, u32>,
}

impl ObjectRecord {
    pub fn new(
        object_id: ObjectId,
        data_size: u64,
        metadata: Bytes,
        creator: ClientId,
        tick: u64,
    ) -> Self {
        Self {
            object_id,
            state: ObjectState::Creating,
            data_size,
            metadata,
            data: Bytes::new(),
            creator,
            last_access: tick,
            sealed_seq: 0,
            delete_pending: false,
            holders: HashMap::new(),
        }
    }

    pub fn metadata_size(&self) -> u64 {
        self.metadata.len() as u64
    }

    /// Bytes of capacity this record reserves
    pub fn footprint(&self) -> u64 {
        self.data_size + self.metadata_size()
    }

    pub fn is_sealed(&self) -> bool {
        self.state == ObjectState::Sealed
    }

    pub fn ref_count(&self) -> u64 {
        self.holders.values().map(|&n| n as u64).sum()
    }

    pub fn held_by(&self, client: ClientId) -> u32 {
        self.holders.get(&client).copied().unwrap_or(0)
    }

    pub fn is_evictable(&self) -> bool {
        self.is_sealed() && self.holders.is_empty()
    }

    pub fn acquire(&mut self, client: ClientId) {
        *self.holders.entry(client).or_insert(0) += 1;
    }

    /// Drop one reference held by `client`
    ///
    /// Returns false if `client` held none.
    pub fn release(&mut self, client: ClientId) -> bool {
        match self.holders.get_mut(&client) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.holders.remove(&client);
                true
            }
            None => false,
        }
    }

    /// Drop every reference held by `client`, returning how many there were
    pub fn drop_client(&mut self, client: ClientId) -> u32 {
        self.holders.remove(&client).unwrap_or(0)
    }

    /// Both regions, once sealed; cloning shares the underlying memory
    pub fn payload(&self) -> Option<ObjectPayload> {
        self.is_sealed().then(|| ObjectPayload {
            data: self.data.clone(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn digest(&self) -> Option<Digest> {
        self.is_sealed()
            .then(|| Digest::compute(&self.data, &self.metadata))
    }
}

#[derive(Debug, Default)]
pub struct ObjectTable {
    index: HashMap<ObjectId, usize>,
    slots: Vec<Option<ObjectRecord>>,
    free: Vec<usize>,
    used_bytes: u64,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Sum of the footprints of all live records
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ObjectRecord> {
        let slot = *self.index.get(id)?;
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut ObjectRecord> {
        let slot = *self.index.get(id)?;
        self.slots[slot].as_mut()
    }

    /// Insert a record for an id with no live record
    ///
    /// Hands the record back if the id is already taken.
    pub fn insert(&mut self, record: ObjectRecord) -> Result<(), ObjectRecord> {
        if self.index.contains_key(&record.object_id) {
            return Err(record);
        }
        let id = record.object_id;
        self.used_bytes += record.footprint();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(record);
                slot
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        Ok(())
    }

    pub fn remove(&mut self, id: &ObjectId) -> Option<ObjectRecord> {
        let slot = self.index.remove(id)?;
        let record = self.slots[slot].take()?;
        self.free.push(slot);
        self.used_bytes -= record.footprint();
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ObjectRecord> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> ObjectId {
        ObjectId::new([b; denc::OBJECT_ID_SIZE])
    }

    fn record(b: u8, size: u64) -> ObjectRecord {
        ObjectRecord::new(id(b), size, Bytes::from_static(b"md"), 1, 0)
    }

    #[test]
    fn test_insert_and_remove_track_usage() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 10)).unwrap();
        table.insert(record(2, 20)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.used_bytes(), 34);

        let removed = table.remove(&id(1)).unwrap();
        assert_eq!(removed.data_size, 10);
        assert_eq!(table.used_bytes(), 22);
        assert!(table.get(&id(1)).is_none());
        assert!(table.remove(&id(1)).is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 10)).unwrap();
        let rejected = table.insert(record(1, 99)).unwrap_err();
        assert_eq!(rejected.data_size, 99);
        assert_eq!(table.get(&id(1)).unwrap().data_size, 10);
    }

    #[test]
    fn test_slots_are_reused() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 1)).unwrap();
        table.insert(record(2, 1)).unwrap();
        table.remove(&id(1));
        table.insert(record(3, 1)).unwrap();
        assert_eq!(table.slots.len(), 2);
        assert_eq!(table.iter().count(), 2);
    }

    #[test]
    fn test_holders() {
        let mut rec = record(1, 4);
        rec.acquire(7);
        rec.acquire(7);
        rec.acquire(8);
        assert_eq!(rec.ref_count(), 3);
        assert_eq!(rec.held_by(7), 2);
        assert!(rec.release(7));
        assert!(!rec.release(9));
        assert_eq!(rec.drop_client(7), 1);
        assert_eq!(rec.ref_count(), 1);
        assert!(rec.release(8));
        assert!(!rec.release(8));
        assert_eq!(rec.ref_count(), 0);
    }

    #[test]
    fn test_payload_only_when_sealed() {
        let mut rec = record(1, 3);
        assert!(rec.payload().is_none());
        assert!(rec.digest().is_none());
        assert!(!rec.is_evictable());

        rec.data = Bytes::from_static(b"abc");
        rec.state = ObjectState::Sealed;
        assert!(rec.is_evictable());
        let payload = rec.payload().unwrap();
        assert_eq!(&payload.data[..], b"abc");
        assert_eq!(rec.digest(), Some(Digest::compute(b"abc", b"md")));
    }
}
