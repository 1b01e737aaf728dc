//! # Statefeed
//!
//! Snapshot-consistent, gapless change-event streams over a mutating
//! state store.
//!
//! ## Core Concepts
//!
//! - **Mutation log**: per-subject, append-only, indexed change events
//! - **Snapshots**: current state of a subject, valid at one exact index
//! - **Subscriptions**: snapshot, then every later event in order, with
//!   automatic resnapshot when a reader falls behind the log
//! - **Registry**: per-subject fan-out of append notifications
//! - **Streams**: wire framing and the in-process transport that carries
//!   subscriptions to clients
//!
//! ## Example
//!
//! ```ignore
//! use statefeed::{CancelToken, EventPublisher, Mutation, PublisherConfig, SubscribeRequest, Subject, Topic};
//!
//! let publisher = EventPublisher::new(PublisherConfig::default())?;
//! let subject = Subject::new(Topic::ServiceHealth, "redis");
//!
//! // Write
//! publisher.apply(&subject, Mutation::Upsert(payload))?;
//!
//! // Subscribe: snapshot entries, EndOfSnapshot, then live events
//! let request = SubscribeRequest::new(Topic::ServiceHealth, "redis");
//! let mut sub = publisher.subscribe(&request, CancelToken::new())?;
//! while let Some(event) = sub.next() {
//!     println!("{:?}", event?);
//! }
//! ```

pub mod error;
pub mod log;
pub mod publisher;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{EvictionReason, Result, StatusCode, StreamError};
pub use log::{Journal, JournalConfig, LogConfig, MutationLog, Since};
pub use publisher::{EventPublisher, PublisherConfig};
pub use snapshot::{Snapshot, SnapshotMaterializer};
pub use store::{Mutation, SnapshotSource, StateStore, StoreSnapshot};
pub use stream::{ChannelSink, EventSink, EventStream, Frame, StreamAdapter};
pub use subscriptions::{
    CancelToken, SubscribeRequest, Subscription, SubscriptionConfig, SubscriptionId,
    SubscriptionRegistry, SubscriptionState,
};
pub use transport::{
    BackoffConfig, Certificate, CertificateAuthority, ClientConn, ConnectionPool,
    ConnectivityState, Server, ServerConfig, ServerResolver, TlsConfig, TlsConfigurator,
};
pub use types::*;
