//! Pull-based decoder for a store's notification channel
//!
//! The first error poisons the stream: the channel may be desynchronised
//! past a bad frame, so every later read reports [`ClientError::StreamClosed`]
//! instead of guessing where the next frame starts.

use crate::error::{ClientError, Result};
use denc::NotificationEvent;
use futures::Stream;
use msgr::{decode_notification, FrameReader};
use std::any::Any;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

pub struct NotificationStream {
    reader: FrameReader<BoxedRead>,
    /// Other half of the channel, held open for as long as we read
    _link: Option<Box<dyn Any + Send>>,
    poisoned: bool,
}

impl NotificationStream {
    /// Decode notifications from a raw byte channel
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: FrameReader::new(Box::new(reader)),
            _link: None,
            poisoned: false,
        }
    }

    pub(crate) fn with_link(reader: FrameReader<BoxedRead>, link: Box<dyn Any + Send>) -> Self {
        Self {
            reader,
            _link: Some(link),
            poisoned: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.poisoned
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> Result<NotificationEvent> {
        if self.poisoned {
            return Err(ClientError::StreamClosed);
        }
        match self.read_event().await {
            Ok(event) => Ok(event),
            Err(e) => {
                self.poisoned = true;
                warn!("Notification stream failed: {}", e);
                Err(e)
            }
        }
    }

    async fn read_event(&mut self) -> Result<NotificationEvent> {
        let frame = self
            .reader
            .next_frame()
            .await?
            .ok_or(ClientError::StreamClosed)?;
        let info = decode_notification(&frame)?;
        let event = NotificationEvent::try_from(info)?;
        debug!(
            "Notification for {} ({}, {})",
            event.object_id, event.data_size, event.metadata_size
        );
        Ok(event)
    }

    /// Adapt to a [`Stream`] that ends after yielding its first error
    pub fn into_stream(self) -> impl Stream<Item = Result<NotificationEvent>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next_event().await {
                Ok(event) => Some((Ok(event), Some(stream))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
