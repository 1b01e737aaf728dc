//! Client end of a subscription stream.

use super::wire::{decode_frame, Frame};
use crate::error::{Result, StreamError};
use crate::subscriptions::CancelToken;
use crate::types::Event;
use crossbeam_channel::{select, Receiver};
use std::fmt;

/// Receives decoded events from a server-side stream.
///
/// Data frames arrive on `receiver`. The terminal status, if the server
/// sent one, is read from `status` once the data channel is drained and
/// closed. Dropping the stream cancels it, which stops the server side.
pub struct EventStream {
    receiver: Receiver<Vec<u8>>,
    status: Receiver<Vec<u8>>,
    cancel: CancelToken,
    finished: bool,
}

impl EventStream {
    pub fn new(receiver: Receiver<Vec<u8>>, status: Receiver<Vec<u8>>, cancel: CancelToken) -> Self {
        Self {
            receiver,
            status,
            cancel,
            finished: false,
        }
    }

    /// Next event.
    ///
    /// `Ok(None)` means the server closed the stream without a status.
    /// A terminal status from the server surfaces as
    /// [`StreamError::Status`]. Cancellation and deadline take precedence
    /// over frames already buffered.
    pub fn recv(&mut self) -> Result<Option<Event>> {
        if self.finished {
            return Ok(None);
        }
        self.cancel.check()?;

        let deadline = self.cancel.deadline_timer();
        select! {
            recv(self.receiver) -> msg => match msg {
                Ok(bytes) => self.decode(&bytes),
                Err(_) => {
                    self.finished = true;
                    match self.status.try_recv() {
                        Ok(bytes) => self.decode(&bytes),
                        Err(_) => Ok(None),
                    }
                }
            },
            recv(self.cancel.signal()) -> _ => Err(self.cancel.error().unwrap_or(StreamError::Cancelled)),
            recv(deadline) -> _ => Err(StreamError::DeadlineExceeded),
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<Option<Event>> {
        match decode_frame(bytes)? {
            Frame::Event(event) => Ok(Some(event)),
            Frame::Status { code, message } => {
                self.finished = true;
                Err(StreamError::Status { code, message })
            }
        }
    }

    /// Cancel the stream. Later calls to `recv` return `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl Iterator for EventStream {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().transpose()
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("buffered", &self.receiver.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
