//! In-process transport: servers, name resolution, pooled client
//! connections and TLS trust configuration.
//!
//! These stand in for a network RPC stack. They keep its observable
//! behavior (handshakes against the active trust configuration,
//! backoff-driven reconnects, streams that end on cancel or shutdown)
//! without sockets.

mod pool;
mod resolver;
mod server;
mod tls;

pub use pool::{BackoffConfig, ClientConn, ConnectionPool, ConnectivityState};
pub use resolver::ServerResolver;
pub use server::{Server, ServerConfig};
pub use tls::{
    handshake, Certificate, CertificateAuthority, TlsConfig, TlsConfigurator, TrustConfigChanged,
};
