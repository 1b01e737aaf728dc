//! Bridges a subscription to a transport-level outbound stream.

use super::wire::{encode_frame, Frame};
use crate::error::{Result, StreamError};
use crate::subscriptions::{CancelToken, Subscription};
use crossbeam_channel::{select, Sender};
use tracing::{debug, warn};

/// Outbound side of a stream.
pub trait EventSink {
    /// Hand one frame to the transport, blocking under backpressure.
    ///
    /// Fails once the far end is gone.
    fn send(&mut self, frame: Frame) -> Result<()>;

    /// Hand over the terminal status frame. Must not block; the far end
    /// may have stopped reading.
    fn finish(&mut self, frame: Frame) {
        let _ = self.send(frame);
    }
}

/// Encodes frames onto a bounded channel.
///
/// A full channel blocks the sender until the reader catches up or the
/// token is cancelled. The terminal status goes to its own one-slot
/// channel so a full data channel can never swallow it.
pub struct ChannelSink {
    sender: Sender<Vec<u8>>,
    status: Sender<Vec<u8>>,
    cancel: CancelToken,
}

impl ChannelSink {
    pub fn new(sender: Sender<Vec<u8>>, status: Sender<Vec<u8>>, cancel: CancelToken) -> Self {
        Self {
            sender,
            status,
            cancel,
        }
    }
}

impl EventSink for ChannelSink {
    fn send(&mut self, frame: Frame) -> Result<()> {
        let bytes = encode_frame(&frame)?;
        let deadline = self.cancel.deadline_timer();
        select! {
            send(self.sender, bytes) -> res => res.map_err(|_| StreamError::TransportClosed),
            recv(self.cancel.signal()) -> _ => Err(self.cancel.error().unwrap_or(StreamError::Cancelled)),
            recv(deadline) -> _ => Err(StreamError::DeadlineExceeded),
        }
    }

    fn finish(&mut self, frame: Frame) {
        if let Ok(bytes) = encode_frame(&frame) {
            let _ = self.status.try_send(bytes);
        }
    }
}

/// Pumps a subscription's events into a sink until the stream ends.
pub struct StreamAdapter {
    subscription: Subscription,
    delivered: u64,
}

impl StreamAdapter {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            delivered: 0,
        }
    }

    /// Run until the subscription ends.
    ///
    /// Returns the number of delivered events when the stream ended by
    /// cancellation. Any other ending is an error; when the sink is still
    /// usable it receives a terminal status frame first.
    pub fn run<S: EventSink + ?Sized>(mut self, sink: &mut S) -> Result<u64> {
        loop {
            let event = match self.subscription.next_event() {
                Ok(event) => event,
                Err(e) if e.is_cancellation() => {
                    debug!(
                        subject = %self.subscription.subject(),
                        delivered = self.delivered,
                        "stream cancelled"
                    );
                    return Ok(self.delivered);
                }
                Err(e) => {
                    warn!(
                        subject = %self.subscription.subject(),
                        error = %e,
                        "stream ended with error"
                    );
                    self.finish(sink, &e);
                    return Err(e);
                }
            };

            if let Err(e) = sink.send(Frame::Event(event)) {
                // A pump stuck on a full sink is cancelled by the server only
                // after evicting it; report the eviction, not the cancel.
                let e = match self.subscription.eviction() {
                    Some(reason) if e.is_cancellation() => StreamError::Evicted(reason),
                    _ => e,
                };
                self.subscription.close();
                if e.is_cancellation() {
                    return Ok(self.delivered);
                }
                debug!(
                    subject = %self.subscription.subject(),
                    error = %e,
                    "sink send failed"
                );
                if !matches!(e, StreamError::TransportClosed) {
                    self.finish(sink, &e);
                }
                return Err(e);
            }
            self.delivered += 1;
        }
    }

    fn finish<S: EventSink + ?Sized>(&self, sink: &mut S, error: &StreamError) {
        let frame = Frame::status(error);
        if let Ok(status) = frame.to_json() {
            debug!(
                subject = %self.subscription.subject(),
                %status,
                "sending terminal status"
            );
        }
        sink.finish(frame);
    }
}
