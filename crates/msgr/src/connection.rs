//! Framed connection halves
//!
//! A byte stream is split into a [`FrameReader`] that reassembles frames
//! from arbitrary read boundaries and a [`FrameWriter`] that emits whole
//! frames. Both are generic over tokio I/O so the same code runs over a
//! Unix socket or an in-memory duplex pipe.

use crate::error::{Error, Result};
use crate::frames::{write_frame, Frame};
use bytes::BytesMut;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, trace};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next frame
    ///
    /// # Returns
    /// * `Ok(Some(frame))` - a complete, checksum-verified frame
    /// * `Ok(None)` - the peer closed the stream on a frame boundary
    /// * `Err(_)` - the stream failed or ended inside a frame
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                trace!(
                    "Received frame tag={:?} tid={} len={}",
                    frame.tag,
                    frame.tid,
                    frame.payload.len()
                );
                return Ok(Some(frame));
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended with {} bytes of a partial frame", self.buf.len()),
                )));
            }
        }
    }

    /// Like `next_frame`, but a clean close is also an error
    pub async fn expect_frame(&mut self) -> Result<Frame> {
        self.next_frame().await?.ok_or(Error::Closed)
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        trace!(
            "Sending frame tag={:?} tid={} len={}",
            frame.tag,
            frame.tid,
            frame.payload.len()
        );
        write_frame(&mut self.inner, frame).await
    }
}

pub type SocketReader = FrameReader<OwnedReadHalf>;
pub type SocketWriter = FrameWriter<OwnedWriteHalf>;

/// Split a connected Unix stream into framed halves
pub fn split_stream(stream: UnixStream) -> (SocketReader, SocketWriter) {
    let (read, write) = stream.into_split();
    (FrameReader::new(read), FrameWriter::new(write))
}

/// Connect to a listening store or manager socket
pub async fn connect(path: impl AsRef<Path>) -> Result<(SocketReader, SocketWriter)> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).await.map_err(|e| {
        Error::Connection(format!("Failed to connect to {}: {}", path.display(), e))
    })?;
    debug!("Connected to {}", path.display());
    Ok(split_stream(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Tag;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    fn sample(tid: u64) -> Frame {
        Frame::new(Tag::GetRequest, tid, Bytes::from_static(b"payload"))
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(16);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        let send = tokio::spawn(async move {
            for tid in 0..3 {
                writer.send(&sample(tid)).await.unwrap();
            }
        });
        for tid in 0..3 {
            assert_eq!(reader.next_frame().await.unwrap(), Some(sample(tid)));
        }
        send.await.unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_fatal() {
        let bytes = sample(1).to_bytes().unwrap();
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        drop(a);

        let mut reader = FrameReader::new(b);
        let err = reader.next_frame().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_expect_frame_on_close() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = FrameReader::new(b);
        assert!(matches!(reader.expect_frame().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_unix_socket_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgr.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = split_stream(stream);
            let frame = reader.expect_frame().await.unwrap();
            writer.send(&frame).await.unwrap();
        });

        let (mut reader, mut writer) = connect(&path).await.unwrap();
        writer.send(&sample(7)).await.unwrap();
        assert_eq!(reader.expect_frame().await.unwrap(), sample(7));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect(dir.path().join("absent.sock")).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
