//! Shared-memory object store
//!
//! The store keeps the object table, the LRU clock and the subscriber list
//! behind one short-lived lock. Blocking Get never holds that lock while
//! waiting: it takes a snapshot, and if the snapshot is not good enough it
//! sleeps on the change notifier and looks again.
//!
//! Every reference is attributed to the client that acquired it, so a
//! client that goes away can be cleaned up: its unsealed objects are
//! aborted and its references dropped.

use crate::error::{Result, StoreError};
use crate::eviction::choose_victims;
use crate::notifier::EventNotifier;
use crate::table::{ClientId, ObjectRecord, ObjectState, ObjectTable};
use crate::wait_helper::wait_for_condition;
use bytes::Bytes;
use denc::{Digest, NotificationEvent, ObjectId};
use msgr::{timeout_from_wire, ObjectPayload, Request, Response};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storeconfig::StoreOptions;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// Client id used for objects imported by the manager
pub const SYSTEM_CLIENT: ClientId = 0;

/// Point-in-time usage of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub objects: usize,
    pub sealed: usize,
    pub used_bytes: u64,
    pub capacity: u64,
}

struct StoreState {
    table: ObjectTable,
    notifier: EventNotifier,
    clock: u64,
    seal_seq: u64,
}

impl StoreState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, id: &ObjectId) {
        let tick = self.tick();
        if let Some(record) = self.table.get_mut(id) {
            record.last_access = tick;
        }
    }

    fn is_sealed(&self, id: &ObjectId) -> bool {
        self.table.get(id).is_some_and(ObjectRecord::is_sealed)
    }

    /// Take one reference on `id` for `client` if it is sealed
    fn acquire(&mut self, client: ClientId, id: &ObjectId) -> Option<ObjectPayload> {
        let tick = self.tick();
        let record = self.table.get_mut(id)?;
        let payload = record.payload()?;
        record.acquire(client);
        record.last_access = tick;
        Some(payload)
    }

    /// Remove a sealed record and announce the deletion
    fn remove_sealed(&mut self, id: &ObjectId) -> Option<ObjectRecord> {
        let record = self.table.remove(id)?;
        self.notifier.post(NotificationEvent::deleted(*id));
        Some(record)
    }

    fn finish_pending_delete(&mut self, id: &ObjectId) {
        let ready = self
            .table
            .get(id)
            .is_some_and(|r| r.delete_pending && r.ref_count() == 0);
        if ready {
            debug!("Deferred delete of {} completed", id);
            self.remove_sealed(id);
        }
    }

    fn evict(&mut self, num_bytes: u64) -> u64 {
        let plan = choose_victims(self.table.iter(), num_bytes);
        for id in &plan.victims {
            trace!("Evicting {}", id);
            self.remove_sealed(id);
        }
        if !plan.victims.is_empty() {
            debug!(
                "Evicted {} objects ({} bytes) for a request of {} bytes",
                plan.victims.len(),
                plan.bytes,
                num_bytes
            );
        }
        plan.bytes
    }

    /// Make room for `footprint` more bytes, evicting if needed
    fn reserve(&mut self, footprint: u64, capacity: u64) -> Result<()> {
        let available = capacity.saturating_sub(self.table.used_bytes());
        if footprint <= available {
            return Ok(());
        }
        if footprint <= capacity {
            self.evict(footprint - available);
        }
        let available = capacity.saturating_sub(self.table.used_bytes());
        if footprint > available {
            return Err(StoreError::StoreFull {
                requested: footprint,
                available,
                capacity,
            });
        }
        Ok(())
    }

    fn insert_sealed(&mut self, id: ObjectId, payload: ObjectPayload, creator: ClientId) {
        let tick = self.tick();
        self.seal_seq += 1;
        let mut record =
            ObjectRecord::new(id, payload.data.len() as u64, payload.metadata, creator, tick);
        record.data = payload.data;
        record.state = ObjectState::Sealed;
        record.sealed_seq = self.seal_seq;
        let event =
            NotificationEvent::sealed(id, record.data_size, record.metadata_size());
        if self.table.insert(record).is_ok() {
            self.notifier.post(event);
        }
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    changed: Notify,
    capacity: u64,
    next_client: AtomicU64,
}

/// Handle to a store; clones share the same table
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(capacity: u64) -> Self {
        Self::with_queue_depth(capacity, 1024)
    }

    pub fn with_queue_depth(capacity: u64, notification_queue: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    table: ObjectTable::new(),
                    notifier: EventNotifier::new(notification_queue),
                    clock: 0,
                    seal_seq: 0,
                }),
                changed: Notify::new(),
                capacity,
                next_client: AtomicU64::new(SYSTEM_CLIENT + 1),
            }),
        }
    }

    pub fn from_options(options: &StoreOptions) -> Self {
        Self::with_queue_depth(
            options.store_capacity.0,
            options.notification_queue.0 as usize,
        )
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Wake blocked Get/Wait callers after a table change
    fn changed(&self) {
        self.inner.changed.notify_waiters();
    }

    /// Notifier woken on every table change
    pub fn change_notify(&self) -> &Notify {
        &self.inner.changed
    }

    pub fn register_client(&self) -> ClientId {
        let client = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        debug!("Registered client {}", client);
        client
    }

    /// Reserve an object and give `client` the first reference to it
    ///
    /// The data region itself stays with the client until [`seal`](Self::seal).
    pub fn create(
        &self,
        client: ClientId,
        object_id: ObjectId,
        data_size: u64,
        metadata: Bytes,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.table.contains(&object_id) {
            return Err(StoreError::ObjectExists(object_id));
        }
        let footprint = data_size.saturating_add(metadata.len() as u64);
        state.reserve(footprint, self.inner.capacity)?;

        let tick = state.tick();
        let mut record = ObjectRecord::new(object_id, data_size, metadata, client, tick);
        record.acquire(client);
        state
            .table
            .insert(record)
            .map_err(|r| StoreError::ObjectExists(r.object_id))?;
        debug!(
            "Client {} created {} ({} data bytes, {} total)",
            client, object_id, data_size, footprint
        );
        Ok(())
    }

    /// Freeze an object with the data its creator wrote
    pub fn seal(&self, client: ClientId, object_id: ObjectId, data: Bytes) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.seal_seq += 1;
        let seq = state.seal_seq;
        let tick = state.tick();

        let record = state.table.get_mut(&object_id).ok_or_else(|| {
            StoreError::contract(format!("seal of {} which is not being created", object_id))
        })?;
        if record.state != ObjectState::Creating {
            return Err(StoreError::contract(format!(
                "seal of {} which is already sealed",
                object_id
            )));
        }
        if record.creator != client {
            return Err(StoreError::contract(format!(
                "client {} sealed {} created by client {}",
                client, object_id, record.creator
            )));
        }
        if data.len() as u64 != record.data_size {
            return Err(StoreError::contract(format!(
                "seal of {} with {} bytes, created with {}",
                object_id,
                data.len(),
                record.data_size
            )));
        }

        record.data = data;
        record.state = ObjectState::Sealed;
        record.sealed_seq = seq;
        record.last_access = tick;
        let event =
            NotificationEvent::sealed(object_id, record.data_size, record.metadata_size());
        state.notifier.post(event);
        drop(state);

        debug!("Client {} sealed {}", client, object_id);
        self.changed();
        Ok(())
    }

    /// Get sealed objects, waiting up to `timeout` for all of them
    ///
    /// The result has one entry per id, in order. An entry is `None` when the
    /// object was not sealed by the deadline; each `Some` carries one
    /// reference for `client`.
    pub async fn get(
        &self,
        client: ClientId,
        object_ids: &[ObjectId],
        timeout: Option<Duration>,
    ) -> Vec<Option<ObjectPayload>> {
        let acquire_all = || {
            let mut state = self.inner.state.lock();
            if !object_ids.iter().all(|id| state.is_sealed(id)) {
                return None;
            }
            Some(
                object_ids
                    .iter()
                    .map(|id| state.acquire(client, id))
                    .collect::<Vec<_>>(),
            )
        };

        match wait_for_condition(acquire_all, &self.inner.changed, timeout, ()).await {
            Ok(objects) => objects,
            Err(()) => {
                let mut state = self.inner.state.lock();
                let objects: Vec<_> = object_ids
                    .iter()
                    .map(|id| state.acquire(client, id))
                    .collect();
                trace!(
                    "Get for client {} timed out with {}/{} objects",
                    client,
                    objects.iter().filter(|o| o.is_some()).count(),
                    objects.len()
                );
                objects
            }
        }
    }

    /// Drop one reference `client` holds on `object_id`
    pub fn release(&self, client: ClientId, object_id: ObjectId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let tick = state.tick();
        let record = state.table.get_mut(&object_id).ok_or_else(|| {
            StoreError::contract(format!("release of unknown object {}", object_id))
        })?;
        if !record.release(client) {
            return Err(StoreError::contract(format!(
                "client {} released {} without holding it",
                client, object_id
            )));
        }
        record.last_access = tick;
        state.finish_pending_delete(&object_id);
        drop(state);
        self.changed();
        Ok(())
    }

    /// Delete a sealed object, deferred until its last reference is released
    ///
    /// Deleting an id with no record is a no-op.
    pub fn delete(&self, object_id: ObjectId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(record) = state.table.get_mut(&object_id) else {
            return Ok(());
        };
        if record.state == ObjectState::Creating {
            return Err(StoreError::contract(format!(
                "delete of {} before it was sealed",
                object_id
            )));
        }
        if record.ref_count() > 0 {
            debug!(
                "Delete of {} deferred: {} references outstanding",
                object_id,
                record.ref_count()
            );
            record.delete_pending = true;
            return Ok(());
        }
        state.remove_sealed(&object_id);
        drop(state);
        debug!("Deleted {}", object_id);
        self.changed();
        Ok(())
    }

    /// True only for sealed objects
    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.inner.state.lock().is_sealed(object_id)
    }

    pub fn state_of(&self, object_id: &ObjectId) -> Option<ObjectState> {
        self.inner
            .state
            .lock()
            .table
            .get(object_id)
            .map(|r| r.state)
    }

    /// Evict least-recently-used unreferenced objects; returns bytes freed
    pub fn evict(&self, num_bytes: u64) -> u64 {
        let freed = self.inner.state.lock().evict(num_bytes);
        if freed > 0 {
            info!("Evicted {} bytes (requested {})", freed, num_bytes);
            self.changed();
        }
        freed
    }

    pub fn digest(&self, object_id: &ObjectId) -> Option<Digest> {
        self.inner.state.lock().table.get(object_id)?.digest()
    }

    /// Read a sealed object without taking a reference
    pub fn read_sealed(&self, object_id: &ObjectId) -> Option<ObjectPayload> {
        let mut state = self.inner.state.lock();
        let payload = state.table.get(object_id)?.payload()?;
        state.touch(object_id);
        Some(payload)
    }

    /// Insert an already sealed object copied from another store
    pub fn import(&self, object_id: ObjectId, payload: ObjectPayload) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.table.contains(&object_id) {
            return Err(StoreError::ObjectExists(object_id));
        }
        let footprint = (payload.data.len() + payload.metadata.len()) as u64;
        state.reserve(footprint, self.inner.capacity)?;
        state.insert_sealed(object_id, payload, SYSTEM_CLIENT);
        drop(state);
        debug!("Imported {}", object_id);
        self.changed();
        Ok(())
    }

    /// Open a subscription
    ///
    /// The receiver first yields one Sealed event per currently sealed
    /// object, in seal order, then every later Seal and Delete.
    pub fn subscribe(&self) -> mpsc::Receiver<NotificationEvent> {
        let mut state = self.inner.state.lock();
        let mut sealed: Vec<&ObjectRecord> = state.table.iter().filter(|r| r.is_sealed()).collect();
        sealed.sort_by_key(|r| r.sealed_seq);
        let replay: Vec<_> = sealed
            .into_iter()
            .map(|r| NotificationEvent::sealed(r.object_id, r.data_size, r.metadata_size()))
            .collect();
        debug!("New subscription, replaying {} sealed objects", replay.len());
        state.notifier.subscribe(replay)
    }

    /// Forget a client
    ///
    /// Objects it was still creating are aborted without notification, and
    /// every reference it held is dropped (completing deferred deletes).
    pub fn disconnect(&self, client: ClientId) {
        let mut state = self.inner.state.lock();
        let mut aborted = Vec::new();
        let mut released = Vec::new();
        for record in state.table.iter_mut() {
            if record.state == ObjectState::Creating && record.creator == client {
                aborted.push(record.object_id);
            } else if record.drop_client(client) > 0 {
                released.push(record.object_id);
            }
        }
        for id in &aborted {
            state.table.remove(id);
        }
        for id in &released {
            state.finish_pending_delete(id);
        }
        drop(state);

        if !aborted.is_empty() {
            warn!(
                "Client {} disconnected with {} unsealed objects; aborted them",
                client,
                aborted.len()
            );
        }
        debug!(
            "Client {} disconnected, dropped references on {} objects",
            client,
            released.len()
        );
        self.changed();
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.inner.state.lock();
        StoreStats {
            objects: state.table.len(),
            sealed: state.table.iter().filter(|r| r.is_sealed()).count(),
            used_bytes: state.table.used_bytes(),
            capacity: self.inner.capacity,
        }
    }

    /// Serve one store request on behalf of `client`
    pub async fn handle_request(&self, client: ClientId, request: Request) -> Response {
        let name = request.name();
        let result = match request {
            Request::Create {
                object_id,
                data_size,
                metadata,
            } => self
                .create(client, object_id, data_size, metadata)
                .map(|()| Response::Create),
            Request::Seal { object_id, data } => {
                self.seal(client, object_id, data).map(|()| Response::Seal)
            }
            Request::Get {
                object_ids,
                timeout_ms,
            } => {
                let objects = self
                    .get(client, &object_ids, timeout_from_wire(timeout_ms))
                    .await;
                Ok(Response::Get { objects })
            }
            Request::Release { object_id } => {
                self.release(client, object_id).map(|()| Response::Release)
            }
            Request::Delete { object_id } => self.delete(object_id).map(|()| Response::Delete),
            Request::Contains { object_id } => Ok(Response::Contains {
                present: self.contains(&object_id),
            }),
            Request::Evict { num_bytes } => Ok(Response::Evict {
                freed: self.evict(num_bytes),
            }),
            Request::Disconnect => {
                self.disconnect(client);
                Ok(Response::Disconnect)
            }
            Request::Subscribe => Err(StoreError::contract(
                "subscribe must be issued on its own connection",
            )),
            Request::Fetch { .. } | Request::Transfer { .. } | Request::Wait { .. } => Err(
                StoreError::NotConnected(format!("{} must be sent to the manager", name)),
            ),
        };

        result.unwrap_or_else(|e| {
            debug!("Client {} {} failed: {}", client, name, e);
            e.into_response()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use denc::OBJECT_ID_SIZE;

    fn id(b: u8) -> ObjectId {
        ObjectId::new([b; OBJECT_ID_SIZE])
    }

    fn put(store: &Store, client: ClientId, object_id: ObjectId, data: &'static [u8]) {
        store
            .create(client, object_id, data.len() as u64, Bytes::from_static(b"m"))
            .unwrap();
        store
            .seal(client, object_id, Bytes::from_static(data))
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_seal_get() {
        let store = Store::new(1024);
        let client = store.register_client();
        store
            .create(client, id(1), 3, Bytes::from_static(b"m"))
            .unwrap();
        assert!(!store.contains(&id(1)));
        assert_eq!(store.state_of(&id(1)), Some(ObjectState::Creating));

        store.seal(client, id(1), Bytes::from_static(b"abc")).unwrap();
        assert!(store.contains(&id(1)));

        let objects = store.get(client, &[id(1), id(2)], Some(Duration::ZERO)).await;
        assert_eq!(objects.len(), 2);
        let first = objects[0].as_ref().unwrap();
        assert_eq!(&first.data[..], b"abc");
        assert_eq!(&first.metadata[..], b"m");
        assert!(objects[1].is_none());
    }

    #[test]
    fn test_create_existing_fails() {
        let store = Store::new(1024);
        let client = store.register_client();
        store.create(client, id(1), 1, Bytes::new()).unwrap();
        assert!(matches!(
            store.create(client, id(1), 1, Bytes::new()),
            Err(StoreError::ObjectExists(_))
        ));
    }

    #[test]
    fn test_seal_contract() {
        let store = Store::new(1024);
        let a = store.register_client();
        let b = store.register_client();
        assert!(matches!(
            store.seal(a, id(1), Bytes::new()),
            Err(StoreError::ContractViolation(_))
        ));

        store.create(a, id(1), 2, Bytes::new()).unwrap();
        assert!(store.seal(b, id(1), Bytes::from_static(b"xy")).is_err());
        assert!(store.seal(a, id(1), Bytes::from_static(b"x")).is_err());
        store.seal(a, id(1), Bytes::from_static(b"xy")).unwrap();
        assert!(matches!(
            store.seal(a, id(1), Bytes::from_static(b"xy")),
            Err(StoreError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_create_evicts_when_full() {
        let store = Store::new(10);
        let client = store.register_client();
        put(&store, client, id(1), b"1234");
        store.release(client, id(1)).unwrap();
        put(&store, client, id(2), b"1234");

        // 10 bytes used, id(1) is the only unreferenced object
        store.create(client, id(3), 4, Bytes::new()).unwrap();
        assert!(!store.contains(&id(1)));
        assert!(store.contains(&id(2)));
        assert_eq!(store.stats().used_bytes, 9);
    }

    #[test]
    fn test_store_full_when_nothing_evictable() {
        let store = Store::new(10);
        let client = store.register_client();
        put(&store, client, id(1), b"12345678");
        let err = store.create(client, id(2), 4, Bytes::new()).unwrap_err();
        assert!(matches!(err, StoreError::StoreFull { requested: 4, .. }));
        assert!(store.contains(&id(1)));

        assert!(matches!(
            store.create(client, id(3), 11, Bytes::new()),
            Err(StoreError::StoreFull { .. })
        ));
    }

    #[test]
    fn test_release_requires_reference() {
        let store = Store::new(1024);
        let a = store.register_client();
        let b = store.register_client();
        put(&store, a, id(1), b"x");
        assert!(store.release(b, id(1)).is_err());
        store.release(a, id(1)).unwrap();
        assert!(store.release(a, id(1)).is_err());
        assert!(store.release(a, id(9)).is_err());
    }

    #[tokio::test]
    async fn test_delete_deferred_until_released() {
        let store = Store::new(1024);
        let client = store.register_client();
        put(&store, client, id(1), b"x");
        let mut events = store.subscribe();
        assert_eq!(events.recv().await.unwrap(), NotificationEvent::sealed(id(1), 1, 1));

        store.delete(id(1)).unwrap();
        assert!(store.contains(&id(1)));
        assert!(events.try_recv().is_err());

        store.release(client, id(1)).unwrap();
        assert!(!store.contains(&id(1)));
        assert_eq!(events.recv().await.unwrap(), NotificationEvent::deleted(id(1)));
    }

    #[test]
    fn test_delete_edge_cases() {
        let store = Store::new(1024);
        let client = store.register_client();
        store.delete(id(1)).unwrap();
        store.create(client, id(2), 1, Bytes::new()).unwrap();
        assert!(matches!(
            store.delete(id(2)),
            Err(StoreError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_recreate_after_delete() {
        let store = Store::new(1024);
        let client = store.register_client();
        put(&store, client, id(1), b"old");
        store.release(client, id(1)).unwrap();
        store.delete(id(1)).unwrap();
        put(&store, client, id(1), b"new");
        assert_eq!(&store.read_sealed(&id(1)).unwrap().data[..], b"new");
    }

    #[test]
    fn test_evict_skips_referenced() {
        let store = Store::new(1024);
        let client = store.register_client();
        put(&store, client, id(1), b"aaaa");
        put(&store, client, id(2), b"bbbb");
        store.release(client, id(2)).unwrap();

        assert_eq!(store.evict(100), 5);
        assert!(store.contains(&id(1)));
        assert!(!store.contains(&id(2)));
        assert_eq!(store.evict(100), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_waits_for_seal() {
        let store = Store::new(1024);
        let producer = store.register_client();
        let consumer = store.register_client();
        store.create(producer, id(1), 1, Bytes::new()).unwrap();

        let store_clone = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store_clone
                .seal(producer, id(1), Bytes::from_static(b"z"))
                .unwrap();
        });

        let objects = store.get(consumer, &[id(1)], None).await;
        assert_eq!(&objects[0].as_ref().unwrap().data[..], b"z");
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_timeout_keeps_partial_results() {
        let store = Store::new(1024);
        let client = store.register_client();
        put(&store, client, id(1), b"x");
        store.create(client, id(2), 1, Bytes::new()).unwrap();

        let objects = store
            .get(client, &[id(2), id(1)], Some(Duration::from_millis(10)))
            .await;
        assert!(objects[0].is_none());
        assert!(objects[1].is_some());
    }

    #[tokio::test]
    async fn test_disconnect_aborts_creating_and_drops_refs() {
        let store = Store::new(1024);
        let a = store.register_client();
        put(&store, a, id(1), b"x");
        store.create(a, id(2), 1, Bytes::new()).unwrap();
        store.delete(id(1)).unwrap();
        let mut events = store.subscribe();
        let _ = events.recv().await;

        store.disconnect(a);
        assert_eq!(store.state_of(&id(2)), None);
        assert_eq!(store.state_of(&id(1)), None);
        assert_eq!(events.recv().await.unwrap(), NotificationEvent::deleted(id(1)));
        assert!(events.try_recv().is_err());
        assert_eq!(store.stats().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_handle_request_maps_errors() {
        let store = Store::new(1024);
        let client = store.register_client();
        let response = store
            .handle_request(client, Request::Release { object_id: id(1) })
            .await;
        match response {
            Response::Error(reply) => assert_eq!(reply.code, msgr::ErrorCode::ContractViolation),
            other => panic!("unexpected {:?}", other),
        }

        let response = store
            .handle_request(client, Request::Fetch { object_ids: vec![] })
            .await;
        assert!(matches!(
            response,
            Response::Error(ref reply) if reply.code == msgr::ErrorCode::NotConnected
        ));
    }
}
