//! Identity and state types shared across the stack.

use std::fmt::{self, Display, Formatter};

use crate::error::ShipErrorKind;

/// A Subject Key Identifier, the stable identity of an EEBUS peer.
///
/// 40 lowercase hex characters, the SHA-1 over the DER SubjectPublicKeyInfo
/// of the peer's certificate. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ski(String);

impl Ski {
    /// The SHA-1 digest length in hex characters.
    const LEN: usize = 40;

    /// Builds the SKI from a raw SHA-1 digest.
    pub fn from_digest(digest: [u8; 20]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parses a user supplied SKI.
    ///
    /// Spaces are tolerated (UIs tend to group the hex in quartets), the rest
    /// must be exactly 40 hex characters. Uppercase input is folded.
    pub fn parse(input: &str) -> Result<Self, InvalidSki> {
        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if cleaned.len() != Self::LEN || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidSki);
        }

        Ok(Self(cleaned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Ski {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a SKI is 40 hex characters")]
pub struct InvalidSki;

/// The SHIP connection mode of one side of a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShipRole {
    /// We accepted the underlying websocket.
    Server,
    /// We dialled the underlying websocket.
    Client,
}

impl Display for ShipRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

/// What we know about a remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDetails {
    /// The peer's certificate identity. Immutable.
    pub ski: Ski,
    /// The ShipID learned during access methods. Once set it may only ever
    /// be confirmed, a different value is an identity mismatch.
    pub ship_id: Option<String>,
    /// The advertised device type, if discovery told us.
    pub device_type: Option<String>,
    /// The operator authorized this SKI.
    pub user_trust: bool,
    /// Trust this SKI without waiting for the operator.
    pub auto_accept: bool,
}

impl ServiceDetails {
    pub fn new(ski: Ski) -> Self {
        Self {
            ski,
            ship_id: None,
            device_type: None,
            user_trust: false,
            auto_accept: false,
        }
    }

    /// Whether a connection to this service starts out trusted: either the
    /// operator said so or a completed pairing left us a ShipID.
    pub fn is_trusted(&self) -> bool {
        self.user_trust || self.auto_accept || self.ship_id.is_some()
    }
}

/// The local service identity threaded through every connection.
#[derive(Debug, Clone)]
pub struct LocalService {
    /// Our own certificate identity.
    pub ski: Ski,
    /// The opaque ShipID we hand out during access methods.
    pub ship_id: String,
    /// The device type we announce.
    pub device_type: String,
}

/// A peer's observable pairing / connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// No connection and no attempt.
    None,
    /// A connection attempt is scheduled.
    Queued,
    /// A dial is in flight.
    Initiated,
    /// An unknown peer suspended in hello-pending, waiting for the operator.
    ReceivedPairingRequest,
    /// The handshake is running.
    InProgress,
    /// Both sides passed the trust phase.
    Trusted,
    /// PIN verification is running.
    Pin,
    /// The connection reached the data phase.
    Completed,
    /// The remote aborted the trust phase.
    RemoteDeniedTrust,
    /// A handshake deadline fired.
    Timeout,
    /// Trust was withdrawn locally.
    NoTrust,
}

/// The state detail reported to the facade, created and mutated only by the
/// hub and the connection driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateDetail {
    pub state: PairingState,
    /// Set when `state` was reached through a failure.
    pub error: Option<ShipErrorKind>,
}

impl ConnectionStateDetail {
    pub const fn new(state: PairingState) -> Self {
        Self { state, error: None }
    }

    pub const fn with_error(state: PairingState, error: ShipErrorKind) -> Self {
        Self {
            state,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ski_parse_accepts_grouped_hex() {
        let ski = Ski::parse("d2bc 0eb4 a9c7 7692 9e3a 39e6 F723 b6d0 553c ab4d").unwrap();
        assert_eq!(ski.as_str(), "d2bc0eb4a9c776929e3a39e6f723b6d0553cab4d");
    }

    #[test]
    fn ski_parse_rejects_wrong_length_and_non_hex() {
        assert_eq!(Ski::parse("abcd"), Err(InvalidSki));
        assert_eq!(
            Ski::parse("zzzz0eb4a9c776929e3a39e6f723b6d0553cab4d"),
            Err(InvalidSki)
        );
    }

    #[test]
    fn stored_ship_id_counts_as_trust() {
        let ski = Ski::from_digest([0; 20]);
        let mut details = ServiceDetails::new(ski);
        assert!(!details.is_trusted());

        details.ship_id = Some("shipid-1".to_owned());
        assert!(details.is_trusted());
    }
}
