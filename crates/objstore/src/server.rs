//! Unix socket server
//!
//! One task per connection reads frames; every request except Subscribe
//! and Disconnect is served on its own task so a blocked Get does not hold
//! up the rest of the connection. Replies funnel through a single writer
//! task. A Subscribe turns the connection into a notification channel: the
//! reply is followed by the replayed and then the live events.
//!
//! A reply that would not fit in one frame is replaced by an `Internal`
//! error; references a Get acquired for such a reply are released first.

use crate::error::Result;
use crate::service::Service;
use crate::table::ClientId;
use denc::{ObjectId, ObjectInfo};
use futures::FutureExt;
use msgr::{
    notification_frame, split_stream, ErrorCode, Frame, FrameWriter, Request, Response,
    MAX_FRAME_PAYLOAD,
};
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

const REPLY_QUEUE: usize = 256;

/// Accept connections until `shutdown` completes
pub async fn serve<S, F>(listener: UnixListener, service: Arc<S>, shutdown: F) -> Result<()>
where
    S: Service,
    F: Future<Output = ()>,
{
    serve_with_frame_limit(listener, service, MAX_FRAME_PAYLOAD, shutdown).await
}

/// Like [`serve`], with replies capped at `frame_limit` payload bytes
pub async fn serve_with_frame_limit<S, F>(
    listener: UnixListener,
    service: Arc<S>,
    frame_limit: usize,
    shutdown: F,
) -> Result<()>
where
    S: Service,
    F: Future<Output = ()>,
{
    let frame_limit = frame_limit.min(MAX_FRAME_PAYLOAD);
    tokio::pin!(shutdown);
    info!("{} listening", service.name());
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let service = Arc::clone(&service);
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, service, frame_limit).await {
                        warn!("Connection closed with error: {}", e);
                    }
                });
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
            _ = &mut shutdown => {
                info!("{} shutting down", service.name());
                break;
            }
        }
    }

    connections.shutdown().await;
    Ok(())
}

async fn handle_connection<S: Service>(
    stream: UnixStream,
    service: Arc<S>,
    frame_limit: usize,
) -> Result<()> {
    let client = service.register_client();
    debug!("{} accepted client {}", service.name(), client);

    let (mut reader, writer) = split_stream(stream);
    let (reply_tx, reply_rx) = mpsc::channel::<Frame>(REPLY_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, reply_rx));

    let mut requests = JoinSet::new();
    let result = read_loop(
        &mut reader,
        &service,
        client,
        &reply_tx,
        &mut requests,
        frame_limit,
    )
    .await;

    // In-flight requests may still acquire references; stop them before
    // releasing what the client held
    requests.shutdown().await;
    service.disconnect(client);
    drop(reply_tx);
    if let Err(e) = writer_task.await {
        error!("Writer task for client {} failed: {}", client, e);
    }
    debug!("{} client {} gone", service.name(), client);
    result
}

async fn read_loop<S: Service>(
    reader: &mut msgr::SocketReader,
    service: &Arc<S>,
    client: ClientId,
    reply_tx: &mpsc::Sender<Frame>,
    requests: &mut JoinSet<()>,
    frame_limit: usize,
) -> Result<()> {
    while let Some(frame) = reader.next_frame().await? {
        let tid = frame.tid;
        let request = Request::from_frame(&frame)?;
        trace!("Client {} tid {} {}", client, tid, request.name());

        match request {
            Request::Subscribe => {
                let events = match service.subscribe() {
                    Ok(events) => events,
                    Err(e) => {
                        send(reply_tx, e.into_response(), tid).await;
                        continue;
                    }
                };
                send(reply_tx, Response::Subscribe, tid).await;
                requests.spawn(push_notifications(events, reply_tx.clone()));
            }
            Request::Disconnect => {
                service.disconnect(client);
                send(reply_tx, Response::Disconnect, tid).await;
                return Ok(());
            }
            other => {
                let service = Arc::clone(service);
                let reply_tx = reply_tx.clone();
                requests.spawn(async move {
                    let frame = serve_request(&*service, client, other, tid, frame_limit).await;
                    queue_frame(&reply_tx, frame, tid).await;
                });
            }
        }

        // Reap finished request tasks so the set does not grow without bound
        while let Some(Some(_)) = requests.join_next().now_or_never() {}
    }
    Ok(())
}

async fn push_notifications(
    mut events: mpsc::Receiver<denc::NotificationEvent>,
    reply_tx: mpsc::Sender<Frame>,
) {
    while let Some(event) = events.recv().await {
        let frame = match notification_frame(&ObjectInfo::from(event)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode notification: {}", e);
                break;
            }
        };
        if reply_tx.send(frame).await.is_err() {
            break;
        }
    }
    debug!("Notification push ended");
}

/// Dispatch one request and encode a reply that fits in a frame
async fn serve_request<S: Service>(
    service: &S,
    client: ClientId,
    request: Request,
    tid: u64,
    frame_limit: usize,
) -> Option<Frame> {
    let requested: Vec<ObjectId> = match &request {
        Request::Get { object_ids, .. } => object_ids.clone(),
        _ => Vec::new(),
    };
    let response = service.dispatch(client, request).await;

    let failure = match response.to_frame(tid) {
        Ok(frame) if frame.payload.len() <= frame_limit => return Some(frame),
        Ok(frame) => {
            warn!(
                "Reply for client {} tid {} is {} bytes, over the {} byte frame limit",
                client,
                tid,
                frame.payload.len(),
                frame_limit
            );
            format!(
                "reply of {} bytes exceeds the {} byte frame limit",
                frame.payload.len(),
                frame_limit
            )
        }
        Err(e) => {
            error!("Failed to encode reply for tid {}: {}", tid, e);
            e.to_string()
        }
    };

    if let Response::Get { objects } = &response {
        release_acquired(service, client, &requested, objects).await;
    }
    encode_reply(Response::error(ErrorCode::Internal, failure), tid)
}

/// Give back the references a Get took for a reply that is never sent
async fn release_acquired<S: Service, T>(
    service: &S,
    client: ClientId,
    requested: &[ObjectId],
    objects: &[Option<T>],
) {
    let acquired = requested
        .iter()
        .zip(objects)
        .filter_map(|(id, object)| object.as_ref().map(|_| *id));
    for object_id in acquired {
        if let Response::Error(e) = service.dispatch(client, Request::Release { object_id }).await
        {
            warn!("Failed to release {} for client {}: {}", object_id, client, e.message);
        }
    }
}

fn encode_reply(response: Response, tid: u64) -> Option<Frame> {
    match response.to_frame(tid) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to encode reply for tid {}: {}", tid, e);
            None
        }
    }
}

async fn queue_frame(reply_tx: &mpsc::Sender<Frame>, frame: Option<Frame>, tid: u64) {
    if let Some(frame) = frame {
        if reply_tx.send(frame).await.is_err() {
            debug!("Dropping reply for tid {}: writer gone", tid);
        }
    }
}

async fn send(reply_tx: &mpsc::Sender<Frame>, response: Response, tid: u64) {
    queue_frame(reply_tx, encode_reply(response, tid), tid).await;
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut reply_rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = reply_rx.recv().await {
        if let Err(e) = writer.send(&frame).await {
            debug!("Write failed, closing connection: {}", e);
            break;
        }
    }
}
