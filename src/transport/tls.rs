//! Swappable TLS trust configuration and certificate checks.
//!
//! Certificates are modelled by fingerprints: an authority signs a subject
//! by hashing its own fingerprint together with the subject name. That is
//! enough to tell a certificate chained to a trusted root from one that is
//! not, which is all connection establishment needs here.

use crate::error::{Result, StreamError};
use crate::types::Hash;
use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Issues certificates chained to itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateAuthority {
    name: String,
    fingerprint: Hash,
}

impl CertificateAuthority {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let fingerprint = Hash::from_parts(&[b"ca:", name.as_bytes()]);
        Self { name, fingerprint }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fingerprint to place in a trust store.
    pub fn fingerprint(&self) -> Hash {
        self.fingerprint
    }

    pub fn issue(&self, subject: impl Into<String>) -> Certificate {
        let subject = subject.into();
        Certificate {
            signature: Certificate::sign(&self.fingerprint, &subject),
            issuer: self.fingerprint,
            subject,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub subject: String,
    pub issuer: Hash,
    pub signature: Hash,
}

impl Certificate {
    fn sign(issuer: &Hash, subject: &str) -> Hash {
        Hash::from_parts(&[&issuer.0, subject.as_bytes()])
    }

    /// A certificate signed by nobody anyone trusts.
    pub fn self_signed(subject: impl Into<String>) -> Self {
        let subject = subject.into();
        let issuer = Hash::from_parts(&[b"self:", subject.as_bytes()]);
        Self {
            signature: Self::sign(&issuer, &subject),
            issuer,
            subject,
        }
    }

    /// Check that the certificate chains to one of `roots`.
    pub fn verify(&self, roots: &[Hash]) -> Result<()> {
        if !roots.contains(&self.issuer) {
            return Err(StreamError::TlsHandshake(format!(
                "certificate for {} signed by unknown authority",
                self.subject
            )));
        }
        if Self::sign(&self.issuer, &self.subject) != self.signature {
            return Err(StreamError::TlsHandshake(format!(
                "certificate for {} has an invalid signature",
                self.subject
            )));
        }
        Ok(())
    }
}

/// One side's TLS settings.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Trusted authority fingerprints.
    pub ca_roots: Vec<Hash>,
    /// Certificate presented to the peer.
    pub certificate: Option<Certificate>,
    /// Require and verify a client certificate (server side).
    pub verify_incoming: bool,
    /// Verify the server certificate (client side).
    pub verify_outgoing: bool,
}

/// Run the handshake between a client and a server configuration.
pub fn handshake(client: &TlsConfig, server: &TlsConfig) -> Result<()> {
    if client.verify_outgoing {
        let cert = server.certificate.as_ref().ok_or_else(|| {
            StreamError::TlsHandshake("server presented no certificate".to_string())
        })?;
        cert.verify(&client.ca_roots)?;
    }

    if server.verify_incoming {
        let cert = client.certificate.as_ref().ok_or_else(|| {
            StreamError::TlsHandshake("client presented no certificate".to_string())
        })?;
        cert.verify(&server.ca_roots)?;
    }

    Ok(())
}

/// Published to listeners after every configuration swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrustConfigChanged {
    pub generation: u64,
}

/// Holds the active TLS configuration and lets it be replaced at runtime.
///
/// Readers always get a complete configuration: the swap is atomic and
/// connection attempts load the current value each time.
pub struct TlsConfigurator {
    current: ArcSwap<TlsConfig>,
    generation: AtomicU64,
    listeners: Mutex<Vec<Sender<TrustConfigChanged>>>,
}

impl TlsConfigurator {
    pub fn new(config: TlsConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            generation: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Configuration without verification in either direction.
    pub fn insecure() -> Self {
        Self::new(TlsConfig::default())
    }

    /// The active configuration.
    pub fn current(&self) -> Arc<TlsConfig> {
        self.current.load_full()
    }

    /// Number of swaps so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Atomically replace the configuration and notify listeners.
    pub fn update(&self, config: TlsConfig) -> u64 {
        self.current.store(Arc::new(config));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let event = TrustConfigChanged { generation };
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.send(event).is_ok());

        info!(generation, listeners = listeners.len(), "TLS configuration reloaded");
        generation
    }

    /// Receive a [`TrustConfigChanged`] after every future `update`.
    pub fn subscribe(&self) -> Receiver<TrustConfigChanged> {
        let (tx, rx) = unbounded();
        self.listeners.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config(ca: &CertificateAuthority, cert: Certificate) -> TlsConfig {
        TlsConfig {
            ca_roots: vec![ca.fingerprint()],
            certificate: Some(cert),
            verify_incoming: true,
            verify_outgoing: true,
        }
    }

    fn client_config(ca: &CertificateAuthority) -> TlsConfig {
        TlsConfig {
            ca_roots: vec![ca.fingerprint()],
            certificate: Some(ca.issue("client.dc1")),
            verify_incoming: false,
            verify_outgoing: true,
        }
    }

    #[test]
    fn test_issued_certificate_verifies() {
        let ca = CertificateAuthority::new("root");
        let cert = ca.issue("server.dc1");
        assert!(cert.verify(&[ca.fingerprint()]).is_ok());

        let other = CertificateAuthority::new("other");
        assert!(cert.verify(&[other.fingerprint()]).is_err());
    }

    #[test]
    fn test_tampered_certificate_fails() {
        let ca = CertificateAuthority::new("root");
        let mut cert = ca.issue("server.dc1");
        cert.subject = "evil.dc1".to_string();
        assert!(matches!(
            cert.verify(&[ca.fingerprint()]),
            Err(StreamError::TlsHandshake(_))
        ));
    }

    #[test]
    fn test_handshake_rejects_self_signed_server() {
        let ca = CertificateAuthority::new("root");
        let server = server_config(&ca, Certificate::self_signed("snakeoil"));
        assert!(handshake(&client_config(&ca), &server).is_err());

        let server = server_config(&ca, ca.issue("server.dc1"));
        assert!(handshake(&client_config(&ca), &server).is_ok());
    }

    #[test]
    fn test_handshake_requires_client_certificate() {
        let ca = CertificateAuthority::new("root");
        let server = server_config(&ca, ca.issue("server.dc1"));
        let anonymous = TlsConfig {
            certificate: None,
            ..client_config(&ca)
        };
        assert!(handshake(&anonymous, &server).is_err());
    }

    #[test]
    fn test_update_swaps_and_notifies() {
        let configurator = TlsConfigurator::insecure();
        let changes = configurator.subscribe();
        assert!(configurator.current().certificate.is_none());

        let ca = CertificateAuthority::new("root");
        let generation = configurator.update(TlsConfig {
            certificate: Some(ca.issue("server.dc1")),
            ..Default::default()
        });

        assert_eq!(generation, 1);
        assert_eq!(configurator.generation(), 1);
        assert!(configurator.current().certificate.is_some());
        assert_eq!(changes.try_recv().unwrap(), TrustConfigChanged { generation: 1 });
    }

    #[test]
    fn test_dropped_listener_is_forgotten() {
        let configurator = TlsConfigurator::insecure();
        drop(configurator.subscribe());
        configurator.update(TlsConfig::default());
        assert!(configurator.listeners.lock().is_empty());
    }
}
