//! Links between a client and a store or manager
//!
//! [`Transport`] is the request/reply seam. [`LocalTransport`] calls an
//! in-process [`Service`] directly; [`SocketTransport`] speaks the framed
//! protocol over a Unix socket, multiplexing concurrent calls on one
//! connection by transaction id.

use crate::error::{ClientError, Result};
use crate::notification::{BoxedRead, NotificationStream};
use async_trait::async_trait;
use msgr::{
    notification_frame, write_frame, ErrorReply, FrameReader, FrameWriter, Request, Response,
};
use objstore::{ClientId, Service};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const SEND_QUEUE: usize = 100;
const PIPE_CAPACITY: usize = 64 * 1024;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait for its reply
    async fn call(&self, request: Request) -> Result<Response>;

    /// Open a notification channel on its own link
    async fn subscribe(&self) -> Result<NotificationStream>;
}

/// Direct calls into a store or manager in the same process
pub struct LocalTransport {
    service: Arc<dyn Service>,
    client: ClientId,
}

impl LocalTransport {
    pub fn new(service: Arc<dyn Service>) -> Self {
        let client = service.register_client();
        debug!("Local link to {} as client {}", service.name(), client);
        Self { service, client }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: Request) -> Result<Response> {
        if matches!(request, Request::Subscribe) {
            return Err(ClientError::contract(
                "subscribe through Transport::subscribe",
            ));
        }
        Ok(self.service.dispatch(self.client, request).await)
    }

    async fn subscribe(&self) -> Result<NotificationStream> {
        let mut events = self
            .service
            .subscribe()
            .map_err(|e| ClientError::from_reply(ErrorReply::new(e.code(), e.to_string()), None))?;

        // Events travel as encoded frames so the local stream exercises the
        // same decoder as a socket subscription
        let (mut pipe_tx, pipe_rx) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let frame = match notification_frame(&event.into()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to encode notification: {}", e);
                        break;
                    }
                };
                if write_frame(&mut pipe_tx, &frame).await.is_err() {
                    break;
                }
            }
            let _ = pipe_tx.shutdown().await;
        });
        Ok(NotificationStream::from_reader(pipe_rx))
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.service.disconnect(self.client);
    }
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response>>>>>;

/// Framed requests over a Unix socket
///
/// One I/O task owns the connection: it writes queued request frames and
/// routes each reply to the caller waiting on its tid.
pub struct SocketTransport {
    path: PathBuf,
    send_tx: mpsc::Sender<msgr::Frame>,
    pending: PendingCalls,
    next_tid: AtomicU64,
    request_timeout: Duration,
    io_task: JoinHandle<()>,
}

impl SocketTransport {
    pub async fn connect(path: impl AsRef<Path>, request_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (reader, writer) = msgr::connect(&path).await?;
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE);
        let pending = PendingCalls::default();

        let io_task = tokio::spawn(io_task(
            path.clone(),
            reader,
            writer,
            send_rx,
            Arc::clone(&pending),
        ));
        info!("Connected to {}", path.display());

        Ok(Self {
            path,
            send_tx,
            pending,
            next_tid: AtomicU64::new(1),
            request_timeout,
            io_task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn round_trip(&self, request: Request) -> Result<Response> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let frame = request.to_frame(tid)?;
        let (result_tx, result_rx) = oneshot::channel();
        self.pending.lock().insert(tid, result_tx);
        // Forget the call however this future ends, including when dropped
        let _registered = PendingEntry {
            pending: &self.pending,
            tid,
        };

        if self.send_tx.send(frame).await.is_err() {
            return Err(msgr::Error::Closed.into());
        }
        result_rx.await.map_err(|_| msgr::Error::Closed)?
    }
}

/// Removes a call's reply slot when the caller stops waiting
struct PendingEntry<'a> {
    pending: &'a PendingCalls,
    tid: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(&self.tid).is_some() {
            trace!("Abandoned call tid={}", self.tid);
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn call(&self, request: Request) -> Result<Response> {
        if matches!(request, Request::Subscribe) {
            return Err(ClientError::contract(
                "subscribe through Transport::subscribe",
            ));
        }
        // Get and Wait carry their own deadline
        if matches!(request, Request::Get { .. } | Request::Wait { .. }) {
            return self.round_trip(request).await;
        }
        let (name, retry_safe) = (request.name(), request.is_retry_safe());
        match tokio::time::timeout(self.request_timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} request to {} timed out after {:?}",
                    name,
                    self.path.display(),
                    self.request_timeout
                );
                Err(ClientError::Timeout {
                    request: name,
                    after: self.request_timeout,
                    retry_safe,
                })
            }
        }
    }

    async fn subscribe(&self) -> Result<NotificationStream> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            msgr::Error::Connection(format!(
                "Failed to connect to {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(Box::new(read) as BoxedRead);
        let mut writer = FrameWriter::new(write);

        writer.send(&Request::Subscribe.to_frame(1)?).await?;
        let reply = reader.expect_frame().await?;
        match Response::from_frame(&reply)? {
            Response::Subscribe => {}
            Response::Error(reply) => return Err(ClientError::from_reply(reply, None)),
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected a subscribe reply, got {:?}",
                    other.tag()
                )))
            }
        }
        debug!("Subscribed at {}", self.path.display());
        // Dropping the write half would end the subscription
        Ok(NotificationStream::with_link(reader, Box::new(writer)))
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

async fn io_task(
    path: PathBuf,
    mut reader: msgr::SocketReader,
    mut writer: msgr::SocketWriter,
    mut send_rx: mpsc::Receiver<msgr::Frame>,
    pending: PendingCalls,
) {
    let failure = loop {
        tokio::select! {
            outgoing = send_rx.recv() => {
                let Some(frame) = outgoing else {
                    break msgr::Error::Closed;
                };
                if let Err(e) = writer.send(&frame).await {
                    error!("Failed to send to {}: {}", path.display(), e);
                    break e;
                }
            }
            incoming = reader.next_frame() => {
                let frame = match incoming {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break msgr::Error::Closed,
                    Err(e) => {
                        error!("Failed to receive from {}: {}", path.display(), e);
                        break e;
                    }
                };
                let Some(result_tx) = pending.lock().remove(&frame.tid) else {
                    warn!("Reply for unknown tid {} from {}", frame.tid, path.display());
                    continue;
                };
                trace!("Reply for tid {}", frame.tid);
                let _ = result_tx.send(Response::from_frame(&frame).map_err(ClientError::from));
            }
        }
    };

    debug!("I/O task for {} exiting: {}", path.display(), failure);
    for (tid, result_tx) in pending.lock().drain() {
        let _ = result_tx.send(Err(ClientError::Msgr(msgr::Error::Connection(format!(
            "{} closed: {}",
            path.display(),
            failure
        )))));
        debug!("Cancelled pending call tid={}", tid);
    }
}
