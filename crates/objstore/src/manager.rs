//! Cross-store manager
//!
//! A manager is attached to one local store and knows a set of peer stores
//! by `address:port`, either in this process or behind another socket. It answers the requests that need more than the local
//! table:
//!
//! - **Fetch**: pull sealed objects from whichever peer has them, in the
//!   background
//! - **Transfer**: push a locally sealed object to a named peer
//! - **Wait**: report, per object, whether it is sealed locally, sealed on
//!   some peer, or nowhere, waiting until enough are available

use crate::error::{Result, StoreError};
use crate::peer::{Peer, PeerAddr, RemoteStore};
use crate::service::{unsupported, Service};
use crate::store::Store;
use crate::table::ClientId;
use crate::wait_helper::wait_for_any;
use async_trait::async_trait;
use denc::{NotificationEvent, ObjectId};
use msgr::{timeout_from_wire, ObjectRequest, ObjectStatus, QueryType, Request, Response};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Registry key of a peer
pub fn endpoint(address: &str, port: u16) -> String {
    format!("{}:{}", address, port)
}

struct ManagerInner {
    local: Store,
    address: String,
    port: u16,
    peers: RwLock<HashMap<String, Peer>>,
    next_client: AtomicU64,
}

#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(local: Store, address: impl Into<String>, port: u16) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                local,
                address: address.into(),
                port,
                peers: RwLock::new(HashMap::new()),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// This manager's own `address:port`
    pub fn endpoint(&self) -> String {
        endpoint(&self.inner.address, self.inner.port)
    }

    pub fn local_store(&self) -> &Store {
        &self.inner.local
    }

    pub fn add_peer(&self, address: &str, port: u16, peer: impl Into<Peer>) {
        let key = endpoint(address, port);
        info!("Manager {} added peer {}", self.endpoint(), key);
        self.inner.peers.write().insert(key, peer.into());
    }

    /// Register a store served by another process
    ///
    /// Must be called inside a tokio runtime.
    pub fn add_remote_peer(&self, peer: &PeerAddr) {
        let remote = RemoteStore::new(peer.socket.clone());
        self.add_peer(&peer.address, peer.port, remote);
    }

    pub fn remove_peer(&self, address: &str, port: u16) -> bool {
        self.inner
            .peers
            .write()
            .remove(&endpoint(address, port))
            .is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    fn peers(&self) -> Vec<Peer> {
        self.inner.peers.read().values().cloned().collect()
    }

    /// Start pulling `object_ids` into the local store; returns immediately
    ///
    /// Ids already sealed locally are skipped. Ids no peer has are ignored;
    /// a later Fetch may find them.
    pub fn fetch(&self, object_ids: &[ObjectId]) {
        for &object_id in object_ids {
            if self.inner.local.contains(&object_id) {
                continue;
            }
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.pull(object_id).await {
                    debug!("Fetch of {} did not complete: {}", object_id, e);
                }
            });
        }
    }

    async fn pull(&self, object_id: ObjectId) -> Result<()> {
        let mut found = None;
        for peer in self.peers().iter().filter(|p| p.contains(&object_id)) {
            match peer.read_sealed(object_id).await {
                Ok(Some(payload)) => {
                    found = Some(payload);
                    break;
                }
                Ok(None) => {}
                Err(e) => debug!("Peer read of {} failed: {}", object_id, e),
            }
        }
        let payload = found.ok_or(StoreError::ObjectNotFound(object_id))?;
        match self.inner.local.import(object_id, payload) {
            Ok(()) => {
                debug!("Fetched {} into {}", object_id, self.endpoint());
                Ok(())
            }
            // Raced with a local create or another fetch
            Err(StoreError::ObjectExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Copy a locally sealed object into the peer at `address:port`
    pub async fn transfer(&self, address: &str, port: u16, object_id: ObjectId) -> Result<()> {
        let key = endpoint(address, port);
        let peer = self
            .inner
            .peers
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotConnected(format!("no peer at {}", key)))?;
        let payload = self
            .inner
            .local
            .read_sealed(&object_id)
            .ok_or(StoreError::ObjectNotFound(object_id))?;

        match peer.import(object_id, payload).await {
            Ok(()) => {
                info!("Transferred {} to {}", object_id, key);
                Ok(())
            }
            Err(StoreError::ObjectExists(_)) => {
                debug!("Peer {} already has {}", key, object_id);
                Ok(())
            }
            Err(e) => {
                warn!("Transfer of {} to {} failed: {}", object_id, key, e);
                Err(e)
            }
        }
    }

    fn resolve(&self, requests: &[ObjectRequest], peers: &[Peer]) -> Vec<ObjectRequest> {
        requests
            .iter()
            .map(|request| {
                let status = if self.inner.local.contains(&request.object_id) {
                    ObjectStatus::Local
                } else if request.query == QueryType::Anywhere
                    && peers.iter().any(|p| p.contains(&request.object_id))
                {
                    ObjectStatus::Remote
                } else {
                    ObjectStatus::Nonexistent
                };
                ObjectRequest { status, ..*request }
            })
            .collect()
    }

    /// Resolve the status of each request, waiting until at least
    /// `num_ready` are available or `timeout` passes
    ///
    /// The answer is one snapshot: statuses are not revised after return.
    pub async fn wait(
        &self,
        requests: &[ObjectRequest],
        num_ready: usize,
        timeout: Option<Duration>,
    ) -> Vec<ObjectRequest> {
        let peers = self.peers();
        let mut notifies: Vec<&Notify> = vec![self.inner.local.change_notify()];
        notifies.extend(peers.iter().map(Peer::change_notify));
        let num_ready = num_ready.min(requests.len());

        let check = || {
            let resolved = self.resolve(requests, &peers);
            let available = resolved.iter().filter(|r| r.status.is_available()).count();
            (available >= num_ready).then_some(resolved)
        };

        match wait_for_any(check, &notifies, timeout, ()).await {
            Ok(resolved) => resolved,
            Err(()) => self.resolve(requests, &peers),
        }
    }

    pub async fn handle_request(&self, request: Request) -> Response {
        let name = request.name();
        let result = match request {
            Request::Fetch { object_ids } => {
                self.fetch(&object_ids);
                Ok(Response::Fetch)
            }
            Request::Transfer {
                address,
                port,
                object_id,
            } => self
                .transfer(&address, port, object_id)
                .await
                .map(|()| Response::Transfer),
            Request::Wait {
                requests,
                num_ready,
                timeout_ms,
            } => {
                let requests = self
                    .wait(&requests, num_ready as usize, timeout_from_wire(timeout_ms))
                    .await;
                Ok(Response::Wait { requests })
            }
            Request::Disconnect => Ok(Response::Disconnect),
            other => Err(unsupported("manager", &other)),
        };
        result.unwrap_or_else(|e| {
            debug!("Manager {} failed: {}", name, e);
            e.into_response()
        })
    }
}

#[async_trait]
impl Service for Manager {
    fn name(&self) -> &'static str {
        "manager"
    }

    fn register_client(&self) -> ClientId {
        self.inner.next_client.fetch_add(1, Ordering::Relaxed)
    }

    async fn dispatch(&self, _client: ClientId, request: Request) -> Response {
        self.handle_request(request).await
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<NotificationEvent>> {
        Err(StoreError::contract(
            "notifications are served by the store, not the manager",
        ))
    }

    fn disconnect(&self, _client: ClientId) {}
}
