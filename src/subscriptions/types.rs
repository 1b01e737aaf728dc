//! Subscription request and configuration types.

use crate::types::{Index, Subject, Topic};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for subscriptions.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Fallback wake-up while caught up, in case an append notification
    /// raced with the reader going to sleep.
    /// Default: 250ms
    pub poll_interval: Duration,

    /// Consecutive resnapshots tolerated before the subscription gives up
    /// (None = unlimited).
    /// Default: None
    pub max_resnapshots: Option<u32>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_resnapshots: None,
        }
    }
}

/// What a client asks for when it opens a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub topic: Topic,
    pub key: String,
    /// Resume after this index instead of starting with a snapshot. When
    /// the log cannot serve it, the subscriber gets `NewSnapshotToFollow`
    /// and a fresh snapshot.
    #[serde(default)]
    pub index: Option<Index>,
}

impl SubscribeRequest {
    pub fn new(topic: Topic, key: impl Into<String>) -> Self {
        Self {
            topic,
            key: key.into(),
            index: None,
        }
    }

    /// Resume after `index`.
    pub fn resume_from(mut self, index: Index) -> Self {
        self.index = Some(index);
        self
    }

    pub fn subject(&self) -> Subject {
        Subject::new(self.topic, self.key.clone())
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Delivering snapshot events; the marker has not been handed out yet.
    Snapshotting,
    /// Delivering log events after the snapshot index.
    Streaming,
    /// Terminal.
    Closed,
}
