//! Server-set name resolution.

use super::server::Server;
use crate::error::{Result, StreamError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Maps a server-set (datacenter) name to the servers currently serving it.
///
/// Owned explicitly and shared by reference: one resolver per logical
/// cluster view, created before any connection and shut down after the
/// last one.
pub struct ServerResolver {
    sets: RwLock<HashMap<String, Vec<Arc<Server>>>>,
    closed: AtomicBool,
}

impl ServerResolver {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::ShuttingDown);
        }
        Ok(())
    }

    /// Add a server to its datacenter's set, replacing one with the same
    /// name.
    pub fn register(&self, server: Arc<Server>) -> Result<()> {
        self.check_open()?;
        let mut sets = self.sets.write();
        let set = sets.entry(server.datacenter().to_string()).or_default();
        set.retain(|s| s.name() != server.name());
        debug!(
            server = server.name(),
            datacenter = server.datacenter(),
            "server registered"
        );
        set.push(server);
        Ok(())
    }

    /// Remove a server. Returns false if it was not registered.
    pub fn deregister(&self, datacenter: &str, name: &str) -> bool {
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(datacenter) else {
            return false;
        };
        let before = set.len();
        set.retain(|s| s.name() != name);
        let removed = set.len() < before;
        if set.is_empty() {
            sets.remove(datacenter);
        }
        removed
    }

    /// Live servers of `datacenter`, in registration order.
    pub fn resolve(&self, datacenter: &str) -> Result<Vec<Arc<Server>>> {
        self.check_open()?;
        let servers: Vec<Arc<Server>> = self
            .sets
            .read()
            .get(datacenter)
            .map(|set| set.iter().filter(|s| !s.is_shutdown()).cloned().collect())
            .unwrap_or_default();

        if servers.is_empty() {
            return Err(StreamError::UnknownServerSet(datacenter.to_string()));
        }
        Ok(servers)
    }

    pub fn datacenters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sets.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Forget every server and refuse further calls.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sets.write().clear();
        info!("server resolver shut down");
    }
}

impl Default for ServerResolver {
    fn default() -> Self {
        Self::new()
    }
}
