//! # Hearth SHIP Core
//!
//! The per-peer half of the SHIP stack: a [`ShipConnection`] drives the SME
//! handshake state machine over an established TLS websocket and tunnels
//! SPINE payloads once the connection reaches the data phase. This is a low
//! level crate, connection brokering, pairing and discovery live in
//! `hearth-ship`.
//!
//! A connection is created from an already accepted or dialled websocket (see
//! [`transport`]), spawned as its own task and observed through the
//! [`ShipPeer`](client::ShipPeer) handle plus a channel of
//! [`ConnectionEvent`](connection::ConnectionEvent)s.

use std::future::Future;

pub mod client;
pub mod connection;
pub mod constants;
pub mod error;
pub mod handles;
pub mod transport;
pub mod types;

pub use client::ShipPeer;
pub use connection::{ConnectionEvent, ShipConnection};
pub use error::{SharedError, ShipError, ShipErrorKind};
pub use types::{
    ConnectionStateDetail, InvalidSki, LocalService, PairingState, ServiceDetails, ShipRole, Ski,
};

/// A SPINE payload received from a remote peer, handed to the application.
#[derive(Debug, Clone)]
pub struct SpineData {
    /// The sending peer.
    pub ski: Ski,
    /// The payload in standard JSON form.
    pub payload: serde_json::Value,
}

// ####################################################################################
// Below here is just helper traits, so we don't have to type out tower::Service bounds
// everywhere but still get to use tower.

/// The application seam for incoming SPINE payloads.
///
/// SPINE semantics are opaque to this crate, the handler receives the raw
/// payload of every data frame in arrival order.
pub trait SpineHandler:
    tower::Service<SpineData, Response = (), Error = tower::BoxError, Future = Self::Future2>
    + Send
    + 'static
{
    // This allows us to put more restrictive bounds on the future without defining the future here
    // explicitly.
    type Future2: Future<Output = Result<Self::Response, Self::Error>> + Send + 'static;
}

impl<T> SpineHandler for T
where
    T: tower::Service<SpineData, Response = (), Error = tower::BoxError> + Send + 'static,
    T::Future: Future<Output = Result<Self::Response, Self::Error>> + Send + 'static,
{
    type Future2 = T::Future;
}
