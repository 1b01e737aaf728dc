//! In-process streaming server.

use super::tls::{handshake, TlsConfig, TlsConfigurator};
use crate::error::Result;
use crate::publisher::EventPublisher;
use crate::stream::{ChannelSink, EventStream, StreamAdapter};
use crate::subscriptions::{CancelToken, SubscribeRequest};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long shutdown lets pumps deliver their terminal status before
/// cancelling them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct Pump {
    handle: JoinHandle<()>,
    /// Server-side token, cancelled with the client's.
    cancel: CancelToken,
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Name unique within the datacenter.
    pub name: String,

    pub datacenter: String,

    /// Encoded frames buffered per stream before the pump blocks.
    /// Default: 1000
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server1".to_string(),
            datacenter: "dc1".to_string(),
            stream_buffer: 1000,
        }
    }
}

/// Serves subscription streams from a publisher.
///
/// Each stream gets a pump thread running the stream adapter into a
/// bounded frame channel read by the client's [`EventStream`].
pub struct Server {
    config: ServerConfig,
    publisher: Arc<EventPublisher>,
    tls: Arc<TlsConfigurator>,
    pumps: Mutex<Vec<Pump>>,
    closed: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, publisher: Arc<EventPublisher>, tls: Arc<TlsConfigurator>) -> Self {
        Self {
            config,
            publisher,
            tls,
            pumps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn datacenter(&self) -> &str {
        &self.config.datacenter
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn tls(&self) -> &Arc<TlsConfigurator> {
        &self.tls
    }

    /// Handshake a client against the server's current TLS configuration.
    pub fn accept(&self, client: &TlsConfig) -> Result<()> {
        handshake(client, &self.tls.current())
    }

    /// Open a stream.
    ///
    /// The handshake and the subscription (including its first snapshot)
    /// happen before this returns, so those failures never reach the client
    /// as a partial stream.
    pub fn subscribe(
        &self,
        client: &TlsConfig,
        request: &SubscribeRequest,
        cancel: CancelToken,
    ) -> Result<EventStream> {
        if let Err(e) = self.accept(client) {
            warn!(server = self.name(), error = %e, "TLS handshake failed");
            return Err(e);
        }

        let pump_cancel = cancel.child();
        let subscription = self.publisher.subscribe(request, pump_cancel.clone())?;
        let id = subscription.id();
        let (tx, rx) = bounded(self.config.stream_buffer.max(1));
        let (status_tx, status_rx) = bounded(1);

        let sink_cancel = pump_cancel.clone();
        let server = self.config.name.clone();
        let handle = thread::Builder::new()
            .name(format!("statefeed-stream-{}", id.0))
            .spawn(move || {
                let mut sink = ChannelSink::new(tx, status_tx, sink_cancel);
                match StreamAdapter::new(subscription).run(&mut sink) {
                    Ok(delivered) => debug!(%server, id = id.0, delivered, "stream finished"),
                    Err(e) => debug!(%server, id = id.0, error = %e, "stream ended"),
                }
            })?;

        let mut pumps = self.pumps.lock();
        pumps.retain(|p| !p.handle.is_finished());
        pumps.push(Pump {
            handle,
            cancel: pump_cancel,
        });

        Ok(EventStream::new(rx, status_rx, cancel))
    }

    /// Streams whose pump is still running.
    pub fn active_streams(&self) -> usize {
        self.pumps
            .lock()
            .iter()
            .filter(|p| !p.handle.is_finished())
            .count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Evict every stream and wait for the pumps to exit. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.publisher.shutdown();

        let pumps = std::mem::take(&mut *self.pumps.lock());
        let count = pumps.len();

        // Evicted pumps exit on their own; one stuck on a full channel
        // only notices cancellation.
        let grace = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < grace && pumps.iter().any(|p| !p.handle.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }
        for pump in &pumps {
            pump.cancel.cancel();
        }

        for pump in pumps {
            if pump.handle.join().is_err() {
                warn!(server = self.name(), "stream pump panicked");
            }
        }
        info!(server = self.name(), streams = count, "server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
