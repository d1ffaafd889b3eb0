//! TLS + WebSocket transport.
//!
//! SHIP trust is certificate-fingerprint based, not CA based: both sides
//! present a certificate, chain validation is skipped and instead the peer's
//! SKI is computed from its certificate after the TLS handshake. Outbound
//! connections additionally check the computed SKI against the expected one
//! and drop the connection on mismatch.

use std::{io, net::Ipv6Addr};

use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{error::ShipError, types::Ski};

pub mod ski;
pub mod tls;

pub use tls::{accept, connect};

/// The local key material, supplied by the embedding application.
///
/// Certificate generation and persistence are out of scope here, any ECDSA
/// P-256 certificate will do.
#[derive(Debug)]
pub struct ShipCredentials {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for ShipCredentials {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl ShipCredentials {
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, ShipError> {
        if certs.is_empty() {
            return Err(ShipError::Certificate("empty certificate chain"));
        }

        Ok(Self { certs, key })
    }

    /// The SKI of the local certificate, our own identity on the wire.
    pub fn local_ski(&self) -> Result<Ski, ShipError> {
        ski::ski_from_certificate(&self.certs[0])
    }
}

/// Binds the SHIP listener dual-stack where the platform allows it, falling
/// back to IPv4 only.
pub async fn bind_listener(port: u16) -> io::Result<TcpListener> {
    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            tracing::debug!("Dual-stack bind failed ({err}), falling back to IPv4");
            TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await
        }
    }
}
