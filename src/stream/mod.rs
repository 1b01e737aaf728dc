//! Stream adapter and wire format.
//!
//! The server side pumps a subscription into an [`EventSink`]; the client
//! side reads the same frames back through an [`EventStream`].

mod adapter;
mod client;
mod wire;

pub use adapter::{ChannelSink, EventSink, StreamAdapter};
pub use client::EventStream;
pub use wire::{decode_frame, encode_frame, Frame};
