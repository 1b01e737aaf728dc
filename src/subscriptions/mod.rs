//! Subscriptions to subject change streams.
//!
//! A subscription first delivers a snapshot of its subject, then every
//! later change in index order:
//! - the registry tracks live subscriptions and wakes them on append
//! - the subscription state machine moves from snapshotting to streaming
//!   and resnapshots when it falls behind the log
//! - cancellation tokens end a blocked subscriber promptly
//!
//! # Example
//!
//! ```ignore
//! let publisher = EventPublisher::new(PublisherConfig::default())?;
//! let request = SubscribeRequest::new(Topic::ServiceHealth, "redis");
//! let mut sub = publisher.subscribe(&request, CancelToken::new())?;
//!
//! loop {
//!     let event = sub.next_event()?;
//!     if event.is_end_of_snapshot() {
//!         println!("snapshot complete at {}", event.index);
//!     }
//! }
//! ```

mod cancel;
mod registry;
mod subscription;
mod types;

pub use cancel::{CancelToken, Waiter};
pub use registry::{Registration, SubscriptionRegistry, WatchState};
pub use subscription::Subscription;
pub(crate) use subscription::SubscriptionParts;
pub use types::{SubscribeRequest, SubscriptionConfig, SubscriptionId, SubscriptionState};
