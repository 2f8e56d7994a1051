//! Stores a manager can pull from and push to
//!
//! A peer is either a [`Store`] in this process or a [`RemoteStore`] behind
//! another Unix socket. A remote peer keeps a mirror of the ids sealed on
//! it, fed by a subscription that is re-established whenever it drops, so
//! availability checks never touch the socket. Object data moves over
//! short-lived connections; closing one releases whatever it held.

use crate::error::{Result, StoreError};
use crate::store::Store;
use denc::{NotificationEvent, ObjectId};
use msgr::{
    connect, decode_notification, ErrorReply, ObjectPayload, Request, Response, SocketReader,
    SocketWriter,
};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Pause between attempts to (re)subscribe to a remote store
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub enum Peer {
    Local(Store),
    Remote(RemoteStore),
}

impl Peer {
    /// Whether the peer has `object_id` sealed
    pub fn contains(&self, object_id: &ObjectId) -> bool {
        match self {
            Peer::Local(store) => store.contains(object_id),
            Peer::Remote(remote) => remote.contains(object_id),
        }
    }

    /// Woken whenever the peer's set of sealed objects may have changed
    pub fn change_notify(&self) -> &Notify {
        match self {
            Peer::Local(store) => store.change_notify(),
            Peer::Remote(remote) => remote.change_notify(),
        }
    }

    pub async fn read_sealed(&self, object_id: ObjectId) -> Result<Option<ObjectPayload>> {
        match self {
            Peer::Local(store) => Ok(store.read_sealed(&object_id)),
            Peer::Remote(remote) => remote.read_sealed(object_id).await,
        }
    }

    /// Insert a sealed copy of `object_id`
    pub async fn import(&self, object_id: ObjectId, payload: ObjectPayload) -> Result<()> {
        match self {
            Peer::Local(store) => store.import(object_id, payload),
            Peer::Remote(remote) => remote.import(object_id, payload).await,
        }
    }
}

impl From<Store> for Peer {
    fn from(store: Store) -> Self {
        Peer::Local(store)
    }
}

impl From<RemoteStore> for Peer {
    fn from(remote: RemoteStore) -> Self {
        Peer::Remote(remote)
    }
}

/// Where a remote peer is registered and how to reach it
///
/// Written as `address:port=socket`, e.g. `10.0.0.2:23894=/run/peer/store.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub address: String,
    pub port: u16,
    pub socket: PathBuf,
}

impl PeerAddr {
    /// Parse a comma-separated list, skipping empty entries
    pub fn parse_list(list: &str) -> Result<Vec<PeerAddr>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse::<PeerAddr>)
            .collect()
    }
}

impl FromStr for PeerAddr {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| StoreError::contract(format!("invalid peer '{}': {}", s, why));
        let (endpoint, socket) = s
            .split_once('=')
            .ok_or_else(|| invalid("expected address:port=socket"))?;
        let (address, port) = endpoint
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected address:port"))?;
        let port = port.parse().map_err(|_| invalid("bad port"))?;
        let socket = socket.trim();
        if address.is_empty() || socket.is_empty() {
            return Err(invalid("empty address or socket"));
        }
        Ok(PeerAddr {
            address: address.to_string(),
            port,
            socket: PathBuf::from(socket),
        })
    }
}

struct Mirror {
    sealed: RwLock<HashSet<ObjectId>>,
    changed: Notify,
}

impl Mirror {
    fn apply(&self, event: NotificationEvent) {
        {
            let mut sealed = self.sealed.write();
            if event.is_deletion() {
                sealed.remove(&event.object_id);
            } else {
                sealed.insert(event.object_id);
            }
        }
        self.changed.notify_waiters();
    }

    fn clear(&self) {
        self.sealed.write().clear();
        self.changed.notify_waiters();
    }

    /// Apply notifications until the subscription ends
    async fn track(&self, reader: &mut SocketReader) -> Result<()> {
        while let Some(frame) = reader.next_frame().await? {
            let event = NotificationEvent::try_from(decode_notification(&frame)?)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            trace!("Peer notification for {}", event.object_id);
            self.apply(event);
        }
        Ok(())
    }
}

struct RemoteInner {
    path: PathBuf,
    mirror: Arc<Mirror>,
    follower: JoinHandle<()>,
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

/// A store served by another process
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteInner>,
}

impl RemoteStore {
    /// Follow the store listening on `path`
    ///
    /// The socket need not exist yet. Must be called inside a tokio runtime.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mirror = Arc::new(Mirror {
            sealed: RwLock::new(HashSet::new()),
            changed: Notify::new(),
        });
        let follower = tokio::spawn(follow(path.clone(), Arc::clone(&mirror)));
        Self {
            inner: Arc::new(RemoteInner {
                path,
                mirror,
                follower,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.inner.mirror.sealed.read().contains(object_id)
    }

    pub fn change_notify(&self) -> &Notify {
        &self.inner.mirror.changed
    }

    /// Copy out a sealed object, or `None` if the peer does not have it
    pub async fn read_sealed(&self, object_id: ObjectId) -> Result<Option<ObjectPayload>> {
        let mut link = Link::open(&self.inner.path).await?;
        let reply = link
            .call(
                Request::Get {
                    object_ids: vec![object_id],
                    timeout_ms: 0,
                },
                object_id,
            )
            .await;
        link.close().await;
        match reply? {
            Response::Get { mut objects } if objects.len() == 1 => Ok(objects.pop().flatten()),
            other => Err(unexpected(&other)),
        }
    }

    /// Create and seal `object_id` on the peer
    pub async fn import(&self, object_id: ObjectId, payload: ObjectPayload) -> Result<()> {
        let mut link = Link::open(&self.inner.path).await?;
        let result = link.create_sealed(object_id, payload).await;
        link.close().await;
        result
    }
}

/// One request/reply connection to a remote store
struct Link {
    reader: SocketReader,
    writer: SocketWriter,
    next_tid: u64,
}

impl Link {
    async fn open(path: &Path) -> Result<Self> {
        let (reader, writer) = connect(path)
            .await
            .map_err(|e| StoreError::NotConnected(e.to_string()))?;
        Ok(Self {
            reader,
            writer,
            next_tid: 1,
        })
    }

    async fn call(&mut self, request: Request, object_id: ObjectId) -> Result<Response> {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.writer.send(&request.to_frame(tid)?).await?;
        let frame = self.reader.expect_frame().await?;
        if frame.tid != tid {
            return Err(StoreError::Internal(format!(
                "reply tid {} does not match request tid {}",
                frame.tid, tid
            )));
        }
        match Response::from_frame(&frame)? {
            Response::Error(reply) => Err(peer_error(reply, object_id)),
            response => Ok(response),
        }
    }

    async fn create_sealed(&mut self, object_id: ObjectId, payload: ObjectPayload) -> Result<()> {
        let create = Request::Create {
            object_id,
            data_size: payload.data.len() as u64,
            metadata: payload.metadata,
        };
        match self.call(create, object_id).await? {
            Response::Create => {}
            other => return Err(unexpected(&other)),
        }
        let seal = Request::Seal {
            object_id,
            data: payload.data,
        };
        match self.call(seal, object_id).await? {
            Response::Seal => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Disconnect, releasing every reference this link took
    async fn close(mut self) {
        let tid = self.next_tid;
        let sent = match Request::Disconnect.to_frame(tid) {
            Ok(frame) => self.writer.send(&frame).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                if let Err(e) = self.reader.expect_frame().await {
                    debug!("Peer link closed before disconnect reply: {}", e);
                }
            }
            Err(e) => debug!("Failed to send disconnect to peer: {}", e),
        }
    }
}

fn peer_error(reply: ErrorReply, object_id: ObjectId) -> StoreError {
    match reply.code {
        msgr::ErrorCode::ObjectExists => StoreError::ObjectExists(object_id),
        msgr::ErrorCode::ObjectNotFound => StoreError::ObjectNotFound(object_id),
        code => StoreError::Peer {
            code,
            message: reply.message,
        },
    }
}

fn unexpected(response: &Response) -> StoreError {
    StoreError::Internal(format!("unexpected {:?} reply from peer", response.tag()))
}

async fn subscribe(path: &Path) -> Result<(SocketReader, SocketWriter)> {
    let (mut reader, mut writer) = connect(path).await?;
    writer.send(&Request::Subscribe.to_frame(1)?).await?;
    let frame = reader.expect_frame().await?;
    match Response::from_frame(&frame)? {
        Response::Subscribe => Ok((reader, writer)),
        Response::Error(reply) => Err(StoreError::Peer {
            code: reply.code,
            message: reply.message,
        }),
        other => Err(unexpected(&other)),
    }
}

async fn follow(path: PathBuf, mirror: Arc<Mirror>) {
    loop {
        match subscribe(&path).await {
            Ok((mut reader, _writer)) => {
                info!("Following peer store at {}", path.display());
                // The subscription replays every sealed object first
                mirror.clear();
                match mirror.track(&mut reader).await {
                    Ok(()) => warn!("Peer store at {} closed the subscription", path.display()),
                    Err(e) => warn!("Lost peer store at {}: {}", path.display(), e),
                }
                mirror.clear();
            }
            Err(e) => debug!("Peer store at {} unavailable: {}", path.display(), e),
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
