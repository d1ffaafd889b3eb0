//! The SME (SHIP message exchange) state machine states.

use std::time::Duration;

use crate::{
    constants::{CMI_TIMEOUT, HANDSHAKE_STEP_TIMEOUT, T_HELLO_INIT},
    error::ShipErrorKind,
    types::{ConnectionStateDetail, PairingState},
};

/// Every state the handshake passes through, plus the two terminal ones.
///
/// The machine only ever advances along the phase order: connection mode
/// initialisation, hello (trust), protocol handshake, pin check, access
/// methods, data phase. Any unexpected input or timer in a non-terminal
/// state moves straight to [`SmeState::Error`], local recovery is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmeState {
    /// Fresh connection, nothing sent yet.
    CmiInitStart,
    /// Client role: waiting for the mirrored init message.
    CmiClientWait,
    /// Server role: waiting for the peer's init message.
    CmiServerWait,

    /// Trusted side announced `ready` and waits for the peer's hello.
    HelloReadyListen,
    /// Untrusted side announced `pending` and waits for the operator or the
    /// peer.
    HelloPendingListen,

    /// Client role: proposal sent, waiting for the server's selection.
    ProtClientListenChoice,
    /// Server role: waiting for the client's proposal.
    ProtServerListenProposal,
    /// Server role: selection sent, waiting for the acknowledgement.
    ProtServerListenConfirm,

    /// Pin state announced, waiting for the peer's.
    PinCheckListen,

    /// Access methods request sent, collecting the peer's request and reply.
    AccessMethodsRequest,

    /// Data phase.
    Complete,

    /// Terminal: the handshake or the data phase failed.
    Error,
    /// Terminal: orderly close.
    Closed,
}

impl SmeState {
    /// The deadline a state arms when it is entered. `None` disarms the
    /// handshake timer (the data phase is paced by keepalive instead).
    pub(super) const fn timeout(self) -> Option<Duration> {
        match self {
            Self::CmiInitStart | Self::CmiClientWait | Self::CmiServerWait => Some(CMI_TIMEOUT),
            Self::HelloReadyListen | Self::HelloPendingListen => Some(T_HELLO_INIT),
            Self::ProtClientListenChoice
            | Self::ProtServerListenProposal
            | Self::ProtServerListenConfirm
            | Self::PinCheckListen
            | Self::AccessMethodsRequest => Some(HANDSHAKE_STEP_TIMEOUT),
            Self::Complete | Self::Error | Self::Closed => None,
        }
    }

    /// Maps the machine state onto the pairing detail observable by
    /// controllers.
    pub(super) const fn detail(self) -> ConnectionStateDetail {
        ConnectionStateDetail::new(match self {
            Self::CmiInitStart
            | Self::CmiClientWait
            | Self::CmiServerWait
            | Self::ProtClientListenChoice
            | Self::ProtServerListenProposal
            | Self::ProtServerListenConfirm
            | Self::AccessMethodsRequest => PairingState::InProgress,
            Self::HelloReadyListen => PairingState::Trusted,
            Self::HelloPendingListen => PairingState::ReceivedPairingRequest,
            Self::PinCheckListen => PairingState::Pin,
            Self::Complete => PairingState::Completed,
            Self::Error | Self::Closed => PairingState::None,
        })
    }
}

/// The detail reported when the machine terminates with `error`.
pub(super) const fn error_detail(kind: ShipErrorKind) -> ConnectionStateDetail {
    let state = match kind {
        ShipErrorKind::TrustDenied => PairingState::RemoteDeniedTrust,
        ShipErrorKind::Timeout => PairingState::Timeout,
        ShipErrorKind::ProtocolViolation
        | ShipErrorKind::Transport
        | ShipErrorKind::IdentityMismatch
        | ShipErrorKind::Internal => PairingState::None,
    };

    ConnectionStateDetail::with_error(state, kind)
}
