use std::sync::{Arc, OnceLock};

use hearth_wire::WireError;

/// A first-error-wins slot shared between a connection task and its handles.
///
/// Only the error that actually terminated the connection is of interest, so
/// the slot keeps whatever was recorded first and silently drops everything
/// reported after it.
pub struct SharedError<T>(Arc<OnceLock<T>>);

impl<T> Clone for SharedError<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for SharedError<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedError<T> {
    pub fn new() -> Self {
        Self(Arc::new(OnceLock::new()))
    }

    /// The recorded error, if the connection has failed.
    pub fn get(&self) -> Option<&T> {
        self.0.get()
    }

    /// Records `err` unless an earlier error is already present. Returns
    /// whether this call's error was stored.
    pub fn set(&self, err: T) -> bool {
        self.0.set(err).is_ok()
    }
}

/// Errors that terminate a SHIP connection.
#[derive(Debug, thiserror::Error)]
pub enum ShipError {
    #[error("the handshake timed out")]
    HandshakeTimeout,
    #[error("the connection timed out")]
    TimedOut,
    #[error("the connection was closed")]
    ConnectionClosed,
    #[error("the connection tasks channel was closed")]
    ChannelClosed,
    #[error("the remote service denied trust")]
    RemoteDeniedTrust,
    #[error("trust for the remote service was withdrawn")]
    TrustWithdrawn,
    #[error("identity mismatch: {0}")]
    IdentityMismatch(&'static str),
    #[error("the peer sent an invalid message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("the peer requested an unsupported pin state")]
    UnsupportedPinState,
    #[error("the peer frame exceeds the handshake size limit: {0} bytes")]
    FrameTooLarge(usize),
    #[error("certificate error: {0}")]
    Certificate(&'static str),
    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("inner service error: {0}")]
    Service(#[from] tower::BoxError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShipError {
    /// The stable classification surfaced to controllers.
    pub const fn kind(&self) -> ShipErrorKind {
        match self {
            Self::HandshakeTimeout | Self::TimedOut => ShipErrorKind::Timeout,
            Self::RemoteDeniedTrust | Self::TrustWithdrawn => ShipErrorKind::TrustDenied,
            Self::IdentityMismatch(_) | Self::Certificate(_) => ShipErrorKind::IdentityMismatch,
            Self::UnexpectedMessage(_) | Self::UnsupportedPinState | Self::FrameTooLarge(_)
            | Self::Wire(_) => ShipErrorKind::ProtocolViolation,
            Self::ConnectionClosed | Self::WebSocket(_) | Self::Tls(_) | Self::Io(_) => {
                ShipErrorKind::Transport
            }
            Self::ChannelClosed | Self::Service(_) => ShipErrorKind::Internal,
        }
    }
}

/// Error taxonomy of [`ShipError`].
///
/// Controllers key localized text off this, and the hub derives its retry
/// policy from it: transport and timeout failures are retried with backoff,
/// everything else needs an external trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipErrorKind {
    /// A message failed its schema or arrived in the wrong state.
    ProtocolViolation,
    /// The socket, TLS session or websocket failed.
    Transport,
    /// The remote aborted the trust phase or trust was withdrawn locally.
    TrustDenied,
    /// The peer's certificate or ShipID does not match what we know.
    IdentityMismatch,
    /// A handshake or keepalive deadline fired.
    Timeout,
    /// A local invariant broke.
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let slot = SharedError::new();
        assert!(slot.get().is_none());

        assert!(slot.set(ShipError::HandshakeTimeout));
        assert!(!slot.set(ShipError::ConnectionClosed));
        assert!(matches!(slot.get(), Some(ShipError::HandshakeTimeout)));
    }
}
