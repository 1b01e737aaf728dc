//! Core types shared by the log, the store and the stream layers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position in the mutation log.
///
/// Indices are assigned by the state store on commit. They are unique
/// across the whole store and strictly increasing within one subject, and
/// they are the only ordering and resumption token a subscriber sees.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Index(pub u64);

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index({})", self.0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Index {
    pub const ZERO: Index = Index(0);

    pub fn next(self) -> Self {
        Index(self.0 + 1)
    }
}

/// Logical category of change events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Health of every instance of a service.
    ServiceHealth,
    /// Health of connect-capable instances (proxies and native) of a service.
    ServiceHealthConnect,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::ServiceHealth => write!(f, "service_health"),
            Topic::ServiceHealthConnect => write!(f, "service_health_connect"),
        }
    }
}

/// A topic plus a key within it: the unit of subscription, ordering and
/// consistency.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub topic: Topic,
    pub key: String,
}

impl Subject {
    pub fn new(topic: Topic, key: impl Into<String>) -> Self {
        Self {
            topic,
            key: key.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.key)
    }
}

/// What an event means to a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An entry was created or replaced.
    Upsert,
    /// An entry was removed; the payload carries its last value.
    Delete,
    /// Marks the snapshot/stream boundary. Carries the snapshot index and
    /// no payload.
    EndOfSnapshot,
    /// The subscriber must discard its local view: a fresh snapshot follows.
    NewSnapshotToFollow,
}

/// A single change event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub key: String,
    pub index: Index,
    pub kind: EventKind,
    pub payload: Option<Payload>,
}

impl Event {
    pub fn upsert(subject: &Subject, index: Index, payload: Payload) -> Self {
        Self {
            topic: subject.topic,
            key: subject.key.clone(),
            index,
            kind: EventKind::Upsert,
            payload: Some(payload),
        }
    }

    pub fn delete(subject: &Subject, index: Index, payload: Payload) -> Self {
        Self {
            topic: subject.topic,
            key: subject.key.clone(),
            index,
            kind: EventKind::Delete,
            payload: Some(payload),
        }
    }

    pub fn end_of_snapshot(subject: &Subject, index: Index) -> Self {
        Self {
            topic: subject.topic,
            key: subject.key.clone(),
            index,
            kind: EventKind::EndOfSnapshot,
            payload: None,
        }
    }

    pub fn new_snapshot_to_follow(subject: &Subject, index: Index) -> Self {
        Self {
            topic: subject.topic,
            key: subject.key.clone(),
            index,
            kind: EventKind::NewSnapshotToFollow,
            payload: None,
        }
    }

    pub fn subject(&self) -> Subject {
        Subject::new(self.topic, self.key.clone())
    }

    pub fn is_end_of_snapshot(&self) -> bool {
        self.kind == EventKind::EndOfSnapshot
    }

    /// The service-health record carried by this event, if any.
    pub fn service_health(&self) -> Option<&CheckServiceNode> {
        match &self.payload {
            Some(Payload::ServiceHealth(csn)) => Some(csn),
            None => None,
        }
    }
}

/// Domain-specific event payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    ServiceHealth(CheckServiceNode),
}

impl Payload {
    /// Identity of the entry within its subject.
    pub fn entry_id(&self) -> String {
        match self {
            Payload::ServiceHealth(csn) => csn.entry_id(),
        }
    }
}

/// A catalog node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub datacenter: String,
}

/// A service instance registered on a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeService {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub check_id: String,
    pub status: HealthStatus,
}

/// A service instance together with its node and health checks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl CheckServiceNode {
    pub fn entry_id(&self) -> String {
        format!("{}/{}", self.node.name, self.service.id)
    }
}

/// Content hash (SHA-256), used for certificate fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Hash of several byte strings fed in order.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. A clock before the epoch reads as zero.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis(node: &str, id: &str, port: u32) -> CheckServiceNode {
        CheckServiceNode {
            node: Node {
                name: node.to_string(),
                address: "3.4.5.6".to_string(),
                datacenter: "dc1".to_string(),
            },
            service: NodeService {
                id: id.to_string(),
                service: "redis".to_string(),
                address: "3.4.5.6".to_string(),
                port,
                tags: vec![],
            },
            checks: vec![],
        }
    }

    #[test]
    fn test_hash_parts_feed_in_order() {
        let ab = Hash::from_parts(&[b"ab", b"cd"]);
        assert_eq!(ab, Hash::from_parts(&[b"abcd"]));
        assert_ne!(ab, Hash::from_parts(&[b"cd", b"ab"]));
        assert_eq!(ab.to_hex().len(), 64);
    }

    #[test]
    fn test_index_next() {
        assert_eq!(Index::ZERO.next(), Index(1));
        assert_eq!(Index(5).next(), Index(6));
    }

    #[test]
    fn test_entry_id_is_node_scoped() {
        let a = Payload::ServiceHealth(redis("node1", "redis1", 8080));
        let b = Payload::ServiceHealth(redis("node2", "redis1", 8080));
        assert_eq!(a.entry_id(), "node1/redis1");
        assert_ne!(a.entry_id(), b.entry_id());
    }

    #[test]
    fn test_end_of_snapshot_has_no_payload() {
        let subject = Subject::new(Topic::ServiceHealth, "redis");
        let marker = Event::end_of_snapshot(&subject, Index(42));
        assert!(marker.is_end_of_snapshot());
        assert!(marker.payload.is_none());
        assert_eq!(marker.index, Index(42));
        assert_eq!(marker.subject(), subject);
    }

    #[test]
    fn test_subject_display() {
        let subject = Subject::new(Topic::ServiceHealthConnect, "web");
        assert_eq!(subject.to_string(), "service_health_connect/web");
    }
}
