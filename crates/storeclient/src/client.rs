//! The object store client
//!
//! `ObjectStoreClient` drives the object lifecycle against one store link
//! and, optionally, one manager link. It keeps two pieces of local state:
//!
//! - how many references the caller holds per object, so a release without
//!   a matching create or get is rejected before anything is sent
//! - the deferred release queue; a release only reaches the store once more
//!   than `release_delay` releases are queued, keeping recently used
//!   objects resident

use crate::buffer::{BufferView, MutableBuffer, ParkedRegions};
use crate::error::{ClientError, Result};
use crate::notification::NotificationStream;
use crate::transfer::{unexpected, TransferAgent};
use crate::transport::{LocalTransport, SocketTransport, Transport};
use crate::wait::{WaitCoordinator, WaitResult};
use bytes::Bytes;
use denc::{Digest, ObjectId};
use msgr::{timeout_to_wire, Request, Response};
use objstore::{Manager, Store};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use storeconfig::ClientOptions;
use tracing::{debug, info, warn};

pub struct ObjectStoreClient {
    store: Arc<dyn Transport>,
    manager: Option<Arc<dyn Transport>>,
    waiter: WaitCoordinator,
    transfers: TransferAgent,
    held: Mutex<HashMap<ObjectId, usize>>,
    release_queue: Mutex<VecDeque<ObjectId>>,
    release_delay: usize,
    parked: ParkedRegions,
}

impl ObjectStoreClient {
    fn with_links(
        store: Arc<dyn Transport>,
        manager: Option<Arc<dyn Transport>>,
        release_delay: usize,
    ) -> Self {
        Self {
            store,
            waiter: WaitCoordinator::new(manager.clone()),
            transfers: TransferAgent::new(manager.clone()),
            manager,
            held: Mutex::new(HashMap::new()),
            release_queue: Mutex::new(VecDeque::new()),
            release_delay,
            parked: ParkedRegions::default(),
        }
    }

    /// Connect to the store socket and, if one is configured, the manager
    /// socket
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        let timeout = options.request_timeout.0;
        let store = SocketTransport::connect(&options.store_socket, timeout).await?;
        let manager: Option<Arc<dyn Transport>> = if options.manager_socket.is_empty() {
            None
        } else {
            Some(Arc::new(
                SocketTransport::connect(&options.manager_socket, timeout).await?,
            ))
        };
        info!(
            "Client connected to {} (manager: {})",
            options.store_socket,
            manager.is_some()
        );
        Ok(Self::with_links(
            Arc::new(store),
            manager,
            options.release_delay.0 as usize,
        ))
    }

    /// A client of stores in this process
    pub fn local(store: Store, manager: Option<Manager>) -> Self {
        let manager: Option<Arc<dyn Transport>> = manager
            .map(|m| Arc::new(LocalTransport::new(Arc::new(m))) as Arc<dyn Transport>);
        Self::with_links(
            Arc::new(LocalTransport::new(Arc::new(store))),
            manager,
            ClientOptions::default().release_delay.0 as usize,
        )
    }

    /// Override how many released objects stay referenced; 0 releases
    /// immediately
    pub fn with_release_delay(mut self, release_delay: usize) -> Self {
        self.release_delay = release_delay;
        self
    }

    pub fn has_manager(&self) -> bool {
        self.manager.is_some()
    }

    /// Create an object and return its writable data region
    ///
    /// If the request times out the store may still create the object; it is
    /// then aborted when this client disconnects.
    pub async fn create(
        &self,
        object_id: ObjectId,
        data_size: usize,
        metadata: impl Into<Bytes>,
    ) -> Result<MutableBuffer> {
        let metadata = metadata.into();
        let reply = self
            .store
            .call(Request::Create {
                object_id,
                data_size: data_size as u64,
                metadata: metadata.clone(),
            })
            .await?;
        match reply {
            Response::Create => {
                self.hold(object_id);
                Ok(MutableBuffer::new(object_id, data_size, metadata, &self.parked))
            }
            other => Err(unexpected(other, Some(object_id))),
        }
    }

    /// Seal a created object with what was written into its buffer
    pub async fn seal(&self, buffer: MutableBuffer) -> Result<()> {
        let object_id = buffer.object_id();
        self.seal_data(object_id, buffer.into_data()).await
    }

    /// Seal an object whose buffer was dropped without sealing
    pub async fn seal_id(&self, object_id: ObjectId) -> Result<()> {
        let data = self.parked.lock().remove(&object_id).ok_or_else(|| {
            ClientError::contract(format!("no unsealed buffer for {}", object_id))
        })?;
        self.seal_data(object_id, data.freeze()).await
    }

    async fn seal_data(&self, object_id: ObjectId, data: Bytes) -> Result<()> {
        match self.store.call(Request::Seal { object_id, data }).await? {
            Response::Seal => {
                debug!("Sealed {}", object_id);
                Ok(())
            }
            other => Err(unexpected(other, Some(object_id))),
        }
    }

    /// Get sealed objects, waiting up to `timeout` for all of them
    ///
    /// The result matches `ids` entry for entry; `None` marks an object that
    /// was not sealed in time. Every returned view must be released.
    pub async fn get(
        &self,
        ids: &[ObjectId],
        timeout: Option<Duration>,
    ) -> Result<Vec<Option<BufferView>>> {
        let reply = self
            .store
            .call(Request::Get {
                object_ids: ids.to_vec(),
                timeout_ms: timeout_to_wire(timeout),
            })
            .await?;
        let objects = match reply {
            Response::Get { objects } => objects,
            other => return Err(unexpected(other, None)),
        };
        if objects.len() != ids.len() {
            return Err(ClientError::Protocol(format!(
                "get of {} ids returned {} entries",
                ids.len(),
                objects.len()
            )));
        }

        Ok(ids
            .iter()
            .zip(objects)
            .map(|(&object_id, payload)| {
                payload.map(|payload| {
                    self.hold(object_id);
                    BufferView::new(object_id, payload)
                })
            })
            .collect())
    }

    /// Give back one reference obtained from create or get
    pub async fn release(&self, object_id: ObjectId) -> Result<()> {
        {
            let mut held = self.held.lock();
            match held.get(&object_id).copied().unwrap_or(0) {
                0 => {
                    return Err(ClientError::contract(format!(
                        "release of {} which this client does not hold",
                        object_id
                    )))
                }
                1 => {
                    held.remove(&object_id);
                }
                count => {
                    held.insert(object_id, count - 1);
                }
            }
        }

        let due: Vec<ObjectId> = {
            let mut queue = self.release_queue.lock();
            queue.push_back(object_id);
            let excess = queue.len().saturating_sub(self.release_delay);
            queue.drain(..excess).collect()
        };
        self.send_releases(due).await
    }

    /// Send releases in order; on failure the unsent ones go back to the
    /// front of the queue
    ///
    /// The failed release itself is not retried: it may have been applied.
    async fn send_releases(&self, ids: Vec<ObjectId>) -> Result<()> {
        let mut ids = ids.into_iter();
        while let Some(object_id) = ids.next() {
            let result = match self.store.call(Request::Release { object_id }).await {
                Ok(Response::Release) => continue,
                Ok(other) => unexpected(other, Some(object_id)),
                Err(e) => e,
            };
            let unsent: Vec<ObjectId> = ids.by_ref().collect();
            warn!(
                "Release of {} failed, {} releases requeued: {}",
                object_id,
                unsent.len(),
                result
            );
            let mut queue = self.release_queue.lock();
            for id in unsent.into_iter().rev() {
                queue.push_front(id);
            }
            return Err(result);
        }
        Ok(())
    }

    /// Send every queued release of `object_id`, or of all objects
    async fn flush_releases(&self, object_id: Option<ObjectId>) -> Result<()> {
        let due: Vec<ObjectId> = {
            let mut queue = self.release_queue.lock();
            match object_id {
                None => queue.drain(..).collect(),
                Some(id) => {
                    let due: Vec<ObjectId> = queue.iter().filter(|&&q| q == id).copied().collect();
                    queue.retain(|&q| q != id);
                    due
                }
            }
        };
        self.send_releases(due).await
    }

    /// Delete an object once nobody references it
    pub async fn delete(&self, object_id: ObjectId) -> Result<()> {
        self.flush_releases(Some(object_id)).await?;
        match self.store.call(Request::Delete { object_id }).await? {
            Response::Delete => Ok(()),
            other => Err(unexpected(other, Some(object_id))),
        }
    }

    /// Whether `object_id` is sealed in the local store
    pub async fn contains(&self, object_id: ObjectId) -> Result<bool> {
        match self.store.call(Request::Contains { object_id }).await? {
            Response::Contains { present } => Ok(present),
            other => Err(unexpected(other, Some(object_id))),
        }
    }

    /// Ask the store to free at least `num_bytes`; returns the bytes freed
    pub async fn evict(&self, num_bytes: u64) -> Result<u64> {
        self.flush_releases(None).await?;
        match self.store.call(Request::Evict { num_bytes }).await? {
            Response::Evict { freed } => Ok(freed),
            other => Err(unexpected(other, None)),
        }
    }

    /// SHA-256 over data then metadata, or `None` if not sealed locally
    pub async fn hash(&self, object_id: ObjectId) -> Result<Option<Digest>> {
        let view = self
            .get(&[object_id], Some(Duration::ZERO))
            .await?
            .pop()
            .flatten();
        let Some(view) = view else {
            return Ok(None);
        };
        let digest = view.digest();
        self.release(object_id).await?;
        Ok(Some(digest))
    }

    pub async fn fetch(&self, ids: &[ObjectId]) -> Result<()> {
        self.transfers.fetch(ids).await
    }

    pub async fn transfer(&self, address: &str, port: u16, object_id: ObjectId) -> Result<()> {
        self.transfers.transfer(address, port, object_id).await
    }

    /// See [`WaitCoordinator::wait`]
    pub async fn wait(
        &self,
        ids: &[ObjectId],
        num_returns: usize,
        timeout: Duration,
    ) -> Result<WaitResult> {
        self.waiter.wait(ids, num_returns, timeout).await
    }

    /// Open a notification stream on the store
    pub async fn subscribe(&self) -> Result<NotificationStream> {
        self.store.subscribe().await
    }

    /// Flush deferred releases and close both links
    ///
    /// Objects this client was still creating are aborted by the store.
    pub async fn disconnect(self) -> Result<()> {
        let flushed = self.flush_releases(None).await;
        if let Err(e) = &flushed {
            warn!("Failed to flush releases on disconnect: {}", e);
        }
        if let Some(manager) = &self.manager {
            if let Err(e) = manager.call(Request::Disconnect).await {
                debug!("Manager disconnect failed: {}", e);
            }
        }
        match self.store.call(Request::Disconnect).await? {
            Response::Disconnect => {}
            other => return Err(unexpected(other, None)),
        }
        info!("Client disconnected");
        flushed
    }

    fn hold(&self, object_id: ObjectId) {
        *self.held.lock().entry(object_id).or_insert(0) += 1;
    }

    /// References the caller holds on `object_id`, including ones whose
    /// release is still queued
    pub fn held_count(&self, object_id: &ObjectId) -> usize {
        let held = self.held.lock().get(object_id).copied().unwrap_or(0);
        let queued = self
            .release_queue
            .lock()
            .iter()
            .filter(|&q| q == object_id)
            .count();
        held + queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn id(b: u8) -> ObjectId {
        ObjectId::new([b; 20])
    }

    /// Passes calls through, failing the first release of one object
    struct FailingRelease {
        inner: LocalTransport,
        object_id: ObjectId,
        failed: AtomicBool,
    }

    #[async_trait]
    impl Transport for FailingRelease {
        async fn call(&self, request: Request) -> Result<Response> {
            if let Request::Release { object_id } = &request {
                if *object_id == self.object_id && !self.failed.swap(true, Ordering::SeqCst) {
                    return Err(ClientError::NotConnected);
                }
            }
            self.inner.call(request).await
        }

        async fn subscribe(&self) -> Result<NotificationStream> {
            self.inner.subscribe().await
        }
    }

    #[tokio::test]
    async fn test_release_without_hold_is_rejected_locally() {
        let client = ObjectStoreClient::local(Store::new(64), None);
        assert!(matches!(
            client.release(id(1)).await,
            Err(ClientError::ContractViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_release_delay_keeps_references() {
        let store = Store::new(1024);
        let client = ObjectStoreClient::local(store.clone(), None).with_release_delay(1);

        for b in [1, 2] {
            let mut buffer = client.create(id(b), 1, Bytes::new()).await.unwrap();
            buffer[0] = b;
            client.seal(buffer).await.unwrap();
        }

        client.release(id(1)).await.unwrap();
        // Queued, so the store still counts the reference
        assert_eq!(store.evict(1024), 0);
        assert_eq!(client.held_count(&id(1)), 1);

        client.release(id(2)).await.unwrap();
        // id(1) was pushed out of the queue
        assert_eq!(client.held_count(&id(1)), 0);
        assert_eq!(store.evict(1024), 1);
        assert!(!store.contains(&id(1)));
        assert!(store.contains(&id(2)));

        client.disconnect().await.unwrap();
        assert_eq!(store.evict(1024), 1);
    }

    #[tokio::test]
    async fn test_failed_release_requeues_the_rest() {
        let store = Store::new(1024);
        let link = FailingRelease {
            inner: LocalTransport::new(Arc::new(store.clone())),
            object_id: id(1),
            failed: AtomicBool::new(false),
        };
        let client = ObjectStoreClient::with_links(Arc::new(link), None, 2);
        for b in [1, 2] {
            let buffer = client.create(id(b), 1, Bytes::new()).await.unwrap();
            client.seal(buffer).await.unwrap();
            client.release(id(b)).await.unwrap();
        }

        // The flush stops at id(1); id(2) stays queued and referenced
        assert!(matches!(
            client.evict(1024).await,
            Err(ClientError::NotConnected)
        ));
        assert_eq!(client.held_count(&id(1)), 0);
        assert_eq!(client.held_count(&id(2)), 1);

        assert_eq!(client.evict(1024).await.unwrap(), 1);
        assert!(!store.contains(&id(2)));
        assert!(store.contains(&id(1)));
    }

    #[tokio::test]
    async fn test_seal_by_id_after_buffer_dropped() {
        let store = Store::new(64);
        let client = ObjectStoreClient::local(store.clone(), None);

        let mut buffer = client.create(id(3), 2, Bytes::new()).await.unwrap();
        buffer.copy_from_slice(b"hi");
        drop(buffer);
        client.seal_id(id(3)).await.unwrap();
        assert_eq!(&store.read_sealed(&id(3)).unwrap().data[..], b"hi");

        assert!(matches!(
            client.seal_id(id(3)).await,
            Err(ClientError::ContractViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_matches_content() {
        let client = ObjectStoreClient::local(Store::new(64), None).with_release_delay(0);
        assert_eq!(client.hash(id(4)).await.unwrap(), None);

        let mut buffer = client.create(id(4), 3, Bytes::from_static(b"md")).await.unwrap();
        buffer.copy_from_slice(b"abc");
        client.seal(buffer).await.unwrap();

        let digest = client.hash(id(4)).await.unwrap();
        assert_eq!(digest, Some(Digest::compute(b"abc", b"md")));
        // hash returned its own reference; only the creator's remains
        assert_eq!(client.held_count(&id(4)), 1);
    }
}
