//! The two primitives the driver needs from the link to the BMS.
//!
//! Outgoing frames go through [`Transport::write`]. Incoming notification
//! chunks are handed to a [`NotificationSink`], either one by one from a
//! callback or by letting [`NotificationSink::pump`] drain a stream.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::Result;

/// Write side of the link, usually a GATT characteristic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one complete frame to the device.
    async fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// Producer side of a connection: raw notification chunks go in here.
#[derive(Clone)]
pub struct NotificationSink {
    dispatcher: Arc<Dispatcher>,
}

impl NotificationSink {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Hands one notification chunk to the frame assembler.
    pub fn push(&self, chunk: &[u8]) {
        log::trace!("notification: {chunk:02X?}");
        self.dispatcher.push(chunk);
    }

    /// Feeds every chunk of `notifications` into the connection until the stream ends.
    ///
    /// A failed notification is logged and skipped, the stream decides whether it
    /// keeps delivering afterwards.
    pub async fn pump<S, E>(self, notifications: S)
    where
        S: Stream<Item = std::result::Result<Vec<u8>, E>>,
        E: Display,
    {
        futures_util::pin_mut!(notifications);
        while let Some(notification) = notifications.next().await {
            match notification {
                Ok(chunk) => self.push(&chunk),
                Err(err) => log::warn!("Notification error: {err}"),
            }
        }
        log::debug!("End of notification stream");
    }
}

impl std::fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSink").finish_non_exhaustive()
    }
}
