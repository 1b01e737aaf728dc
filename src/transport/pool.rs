//! Client connections with backoff-driven retry.

use super::resolver::ServerResolver;
use super::server::Server;
use super::tls::TlsConfigurator;
use crate::error::{Result, StreamError};
use crate::stream::EventStream;
use crate::subscriptions::{CancelToken, SubscribeRequest};
use crossbeam_channel::{bounded, select, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Reconnect backoff.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    /// Default: 1s
    pub base_delay: Duration,

    /// Growth factor per consecutive failure.
    /// Default: 1.6
    pub multiplier: f64,

    /// Upper bound on the delay.
    /// Default: 120s
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            max_delay: Duration::from_secs(120),
        }
    }
}

struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before the next attempt; grows with every call.
    fn next_delay(&mut self) -> Duration {
        let factor = self.config.multiplier.powi(self.failures as i32);
        let delay = self.config.base_delay.as_secs_f64() * factor;
        self.failures = self.failures.saturating_add(1);
        Duration::from_secs_f64(delay.min(self.config.max_delay.as_secs_f64()))
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Connectivity of a [`ClientConn`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Not connected yet; the next call connects.
    Idle,
    Ready,
    /// The last attempt failed; the next one waits for the backoff.
    TransientFailure,
    Shutdown,
}

struct ConnState {
    state: ConnectivityState,
    server: Option<Arc<Server>>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_error: Option<String>,
}

/// A lazily established connection to one datacenter.
pub struct ClientConn {
    datacenter: String,
    resolver: Arc<ServerResolver>,
    tls: Arc<TlsConfigurator>,
    inner: Mutex<ConnState>,
    changed: Condvar,
}

impl ClientConn {
    fn new(
        datacenter: String,
        resolver: Arc<ServerResolver>,
        tls: Arc<TlsConfigurator>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            datacenter,
            resolver,
            tls,
            inner: Mutex::new(ConnState {
                state: ConnectivityState::Idle,
                server: None,
                backoff: Backoff::new(backoff),
                retry_at: None,
                last_error: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().state
    }

    /// Connected server, connecting first if needed.
    ///
    /// While in `TransientFailure` and before the backoff expires this
    /// fails immediately with the last error.
    pub fn connect(&self) -> Result<Arc<Server>> {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectivityState::Shutdown => return Err(StreamError::ShuttingDown),
            ConnectivityState::Ready => {
                if let Some(server) = &inner.server {
                    if !server.is_shutdown() {
                        return Ok(Arc::clone(server));
                    }
                }
            }
            ConnectivityState::TransientFailure => {
                if let Some(retry_at) = inner.retry_at {
                    if Instant::now() < retry_at {
                        return Err(StreamError::ConnectionFailed {
                            target: self.datacenter.clone(),
                            reason: inner.last_error.clone().unwrap_or_default(),
                        });
                    }
                }
            }
            ConnectivityState::Idle => {}
        }
        self.attempt(&mut inner)
    }

    fn attempt(&self, inner: &mut ConnState) -> Result<Arc<Server>> {
        let servers = match self.resolver.resolve(&self.datacenter) {
            Ok(servers) => servers,
            Err(e) => {
                self.fail(inner, &e);
                return Err(e);
            }
        };

        let client_tls = self.tls.current();
        let mut last_err = None;
        for server in servers {
            match server.accept(&client_tls) {
                Ok(()) => {
                    debug!(datacenter = %self.datacenter, server = server.name(), "connected");
                    inner.state = ConnectivityState::Ready;
                    inner.server = Some(Arc::clone(&server));
                    inner.backoff.reset();
                    inner.retry_at = None;
                    inner.last_error = None;
                    self.changed.notify_all();
                    return Ok(server);
                }
                Err(e) => {
                    warn!(
                        datacenter = %self.datacenter,
                        server = server.name(),
                        error = %e,
                        "connection attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| StreamError::UnknownServerSet(self.datacenter.clone()));
        self.fail(inner, &err);
        Err(err)
    }

    fn fail(&self, inner: &mut ConnState, err: &StreamError) {
        let delay = inner.backoff.next_delay();
        inner.state = ConnectivityState::TransientFailure;
        inner.server = None;
        inner.retry_at = Some(Instant::now() + delay);
        inner.last_error = Some(err.to_string());
        debug!(datacenter = %self.datacenter, retry_in = ?delay, "connection in transient failure");
        self.changed.notify_all();
    }

    /// Retry a failed connection now instead of waiting for the backoff.
    pub fn reset_connect_backoff(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectivityState::TransientFailure {
            return;
        }
        debug!(datacenter = %self.datacenter, "connect backoff reset");
        inner.backoff.reset();
        inner.retry_at = None;
        let _ = self.attempt(&mut inner);
    }

    /// Block until the state differs from `from` or `timeout` passes.
    /// Returns true if it changed.
    pub fn wait_for_state_change(&self, from: ConnectivityState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.state == from {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.state != from;
            }
        }
        true
    }

    /// Open a subscription stream on the connected server.
    ///
    /// Dropping the returned stream cancels it without touching `cancel`.
    pub fn subscribe(&self, request: &SubscribeRequest, cancel: &CancelToken) -> Result<EventStream> {
        cancel.check()?;
        let server = self.connect()?;
        let client_tls = self.tls.current();

        match server.subscribe(&client_tls, request, cancel.child()) {
            Err(e @ StreamError::TlsHandshake(_)) => {
                // The server's trust changed under an established connection.
                self.fail(&mut self.inner.lock(), &e);
                Err(e)
            }
            Err(StreamError::ShuttingDown) => {
                let mut inner = self.inner.lock();
                if inner.state == ConnectivityState::Ready {
                    inner.state = ConnectivityState::Idle;
                    inner.server = None;
                    self.changed.notify_all();
                }
                Err(StreamError::ShuttingDown)
            }
            other => other,
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectivityState::Shutdown;
        inner.server = None;
        self.changed.notify_all();
    }
}

type ConnMap = Mutex<HashMap<String, Arc<ClientConn>>>;

/// One [`ClientConn`] per datacenter, sharing a resolver and TLS settings.
///
/// Listens for trust configuration changes and immediately retries every
/// connection that is in transient failure.
pub struct ConnectionPool {
    resolver: Arc<ServerResolver>,
    tls: Arc<TlsConfigurator>,
    backoff: BackoffConfig,
    conns: Arc<ConnMap>,
    stop: Option<Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl ConnectionPool {
    pub fn new(
        resolver: Arc<ServerResolver>,
        tls: Arc<TlsConfigurator>,
        backoff: BackoffConfig,
    ) -> Result<Self> {
        let conns: Arc<ConnMap> = Arc::new(Mutex::new(HashMap::new()));
        let changes = tls.subscribe();
        let (stop, stopped) = bounded::<()>(0);
        let watched: Weak<ConnMap> = Arc::downgrade(&conns);

        let watcher = thread::Builder::new()
            .name("statefeed-tls-watch".to_string())
            .spawn(move || loop {
                let change = select! {
                    recv(changes) -> msg => msg.ok(),
                    recv(stopped) -> _ => None,
                };
                let Some(change) = change else { break };
                let Some(conns) = watched.upgrade() else { break };

                let failed: Vec<Arc<ClientConn>> = conns
                    .lock()
                    .values()
                    .filter(|c| c.state() == ConnectivityState::TransientFailure)
                    .cloned()
                    .collect();
                debug!(
                    generation = change.generation,
                    failed = failed.len(),
                    "trust configuration changed, retrying failed connections"
                );
                for conn in failed {
                    conn.reset_connect_backoff();
                }
            })?;

        Ok(Self {
            resolver,
            tls,
            backoff,
            conns,
            stop: Some(stop),
            watcher: Some(watcher),
        })
    }

    /// The connection for `datacenter`, created idle on first use.
    pub fn client_conn(&self, datacenter: &str) -> Result<Arc<ClientConn>> {
        if self.resolver.is_shutdown() {
            return Err(StreamError::ShuttingDown);
        }

        let mut conns = self.conns.lock();
        let conn = conns.entry(datacenter.to_string()).or_insert_with(|| {
            Arc::new(ClientConn::new(
                datacenter.to_string(),
                Arc::clone(&self.resolver),
                Arc::clone(&self.tls),
                self.backoff.clone(),
            ))
        });
        Ok(Arc::clone(conn))
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        for conn in self.conns.lock().values() {
            conn.close();
        }
        drop(self.stop.take());
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{EventPublisher, PublisherConfig};
    use crate::transport::{CertificateAuthority, ServerConfig, TlsConfig};
    use crate::types::Topic;

    fn long_backoff() -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_secs(30),
            ..Default::default()
        }
    }

    fn insecure_server(resolver: &ServerResolver) -> Arc<Server> {
        let server = Arc::new(Server::new(
            ServerConfig::default(),
            Arc::new(EventPublisher::new(PublisherConfig::default()).unwrap()),
            Arc::new(TlsConfigurator::insecure()),
        ));
        resolver.register(Arc::clone(&server)).unwrap();
        server
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(1.6));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_connect_reaches_ready() {
        let resolver = Arc::new(ServerResolver::new());
        let _server = insecure_server(&resolver);
        let pool = ConnectionPool::new(
            Arc::clone(&resolver),
            Arc::new(TlsConfigurator::insecure()),
            long_backoff(),
        )
        .unwrap();

        let conn = pool.client_conn("dc1").unwrap();
        assert_eq!(conn.state(), ConnectivityState::Idle);
        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectivityState::Ready);

        // Same datacenter, same connection.
        assert!(Arc::ptr_eq(&conn, &pool.client_conn("dc1").unwrap()));
    }

    #[test]
    fn test_failure_fails_fast_until_reset() {
        let resolver = Arc::new(ServerResolver::new());
        let pool = ConnectionPool::new(
            Arc::clone(&resolver),
            Arc::new(TlsConfigurator::insecure()),
            long_backoff(),
        )
        .unwrap();
        let conn = pool.client_conn("dc1").unwrap();

        assert!(matches!(conn.connect(), Err(StreamError::UnknownServerSet(_))));
        assert_eq!(conn.state(), ConnectivityState::TransientFailure);

        // A server appears, but the backoff still holds.
        let _server = insecure_server(&resolver);
        assert!(matches!(
            conn.connect(),
            Err(StreamError::ConnectionFailed { .. })
        ));

        conn.reset_connect_backoff();
        assert!(conn.wait_for_state_change(
            ConnectivityState::TransientFailure,
            Duration::from_secs(5)
        ));
        assert_eq!(conn.state(), ConnectivityState::Ready);
    }

    #[test]
    fn test_client_trust_change_retries_failed_conns() {
        let ca = CertificateAuthority::new("root");
        let resolver = Arc::new(ServerResolver::new());
        let server = Arc::new(Server::new(
            ServerConfig::default(),
            Arc::new(EventPublisher::new(PublisherConfig::default()).unwrap()),
            Arc::new(TlsConfigurator::new(TlsConfig {
                ca_roots: vec![ca.fingerprint()],
                certificate: Some(ca.issue("server.dc1")),
                verify_incoming: true,
                verify_outgoing: true,
            })),
        ));
        resolver.register(server).unwrap();

        // The client starts without a certificate.
        let client_tls = Arc::new(TlsConfigurator::new(TlsConfig {
            ca_roots: vec![ca.fingerprint()],
            certificate: None,
            verify_incoming: false,
            verify_outgoing: true,
        }));
        let pool =
            ConnectionPool::new(Arc::clone(&resolver), Arc::clone(&client_tls), long_backoff()).unwrap();
        let conn = pool.client_conn("dc1").unwrap();

        let request = SubscribeRequest::new(Topic::ServiceHealth, "redis");
        assert!(matches!(
            conn.subscribe(&request, &CancelToken::new()),
            Err(StreamError::TlsHandshake(_))
        ));
        assert_eq!(conn.state(), ConnectivityState::TransientFailure);

        client_tls.update(TlsConfig {
            ca_roots: vec![ca.fingerprint()],
            certificate: Some(ca.issue("client.dc1")),
            verify_incoming: false,
            verify_outgoing: true,
        });

        // No explicit reset: the pool reacts to the change.
        assert!(conn.wait_for_state_change(
            ConnectivityState::TransientFailure,
            Duration::from_secs(5)
        ));
        assert_eq!(conn.state(), ConnectivityState::Ready);
        let mut stream = conn.subscribe(&request, &CancelToken::new()).unwrap();
        assert!(stream.recv().unwrap().unwrap().is_end_of_snapshot());
    }
}
