//! Correlates complete response frames with the request waiting for them.
//!
//! Responses carry no correlation id, only the echoed command code in byte 1.
//! The dispatcher therefore allows a single waiter per command code and shares
//! one frame buffer between all of them. Assembler, waiter table and the last
//! response sit behind one lock, so abandoning a request (deregistering its
//! waiter and dropping a partial frame) is atomic with respect to notification
//! chunks arriving on another thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::assembler::FrameAssembler;
use crate::protocol;
use crate::{Error, Result};

type Reply = Result<Vec<u8>>;

#[derive(Debug)]
struct DispatchState {
    assembler: FrameAssembler,
    waiters: HashMap<u8, oneshot::Sender<Reply>>,
    last_response: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    state: Mutex<DispatchState>,
    verify_checksum: bool,
}

impl Dispatcher {
    pub(crate) fn new(max_frame_len: usize, verify_checksum: bool) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                assembler: FrameAssembler::with_max_len(max_frame_len),
                waiters: HashMap::new(),
                last_response: None,
            }),
            verify_checksum,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        // The state stays consistent even if a holder panicked, every update is a single step
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the waiter slot for `command`.
    pub(crate) fn register(self: &Arc<Self>, command: u8) -> Result<Waiter> {
        let mut state = self.lock();
        if state.waiters.contains_key(&command) {
            return Err(Error::Busy(command));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(command, tx);
        log::debug!("waiting for command {command:#04X}");
        Ok(Waiter {
            dispatcher: Arc::clone(self),
            command,
            rx,
            armed: true,
        })
    }

    /// Feeds a notification chunk and resolves the matching waiter once a frame completes.
    pub(crate) fn push(&self, chunk: &[u8]) {
        let mut state = self.lock();
        let Some(frame) = state.assembler.feed(chunk) else {
            return;
        };
        log::trace!("receive frame: {frame:02X?}");
        state.last_response = Some(frame.clone());

        let Some(&command) = frame.get(1) else {
            log::warn!("Dropping frame without command byte: {frame:02X?}");
            return;
        };
        let Some(waiter) = state.waiters.remove(&command) else {
            log::warn!("Dropping unsolicited frame for command {command:#04X}: {frame:02X?}");
            return;
        };
        let reply = if self.verify_checksum {
            protocol::verify(&frame).map(|()| frame)
        } else {
            Ok(frame)
        };
        if waiter.send(reply).is_err() {
            log::debug!("waiter for command {command:#04X} is gone");
        }
    }

    /// Deregisters the waiter for `command` and drops any partial frame.
    fn abandon(&self, command: u8) {
        let mut state = self.lock();
        state.waiters.remove(&command);
        state.assembler.clear();
    }

    pub(crate) fn last_response(&self) -> Option<Vec<u8>> {
        self.lock().last_response.clone()
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.lock().assembler.len()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// A registered interest in the response to one command.
///
/// Dropping it before the response arrived abandons the request, which also
/// covers the request future itself being dropped by the caller.
#[derive(Debug)]
pub(crate) struct Waiter {
    dispatcher: Arc<Dispatcher>,
    command: u8,
    rx: oneshot::Receiver<Reply>,
    armed: bool,
}

impl Waiter {
    pub(crate) async fn wait(mut self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => {
                self.armed = false;
                reply
            }
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                log::debug!(
                    "no response for command {:#04X} within {timeout:?}",
                    self.command
                );
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.armed {
            self.dispatcher.abandon(self.command);
        }
    }
}
