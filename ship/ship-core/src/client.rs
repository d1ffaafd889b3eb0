//! The hub-facing handle of a live connection.

use tokio::{sync::mpsc, time::timeout};

use crate::{
    constants::WRITE_TIMEOUT,
    error::{SharedError, ShipError},
    handles::ConnectionHandle,
    types::{ShipRole, Ski},
};

/// A handle to a spawned [`ShipConnection`](crate::connection::ShipConnection).
///
/// The task owns the websocket exclusively, the handle only feeds its queues:
/// outgoing SPINE payloads and trust decisions. Dropping the handle does not
/// close the connection, that is the hub's decision via
/// [`ConnectionHandle::send_close_signal`].
#[derive(Clone)]
pub struct ShipPeer {
    /// The remote identity this connection is bound to.
    pub ski: Ski,
    /// Our SHIP role on this connection.
    pub role: ShipRole,
    /// Close signalling and liveness.
    pub handle: ConnectionHandle,

    data_tx: mpsc::Sender<serde_json::Value>,
    trust_tx: mpsc::Sender<bool>,
    error: SharedError<ShipError>,
}

impl ShipPeer {
    pub(crate) fn new(
        ski: Ski,
        role: ShipRole,
        handle: ConnectionHandle,
        data_tx: mpsc::Sender<serde_json::Value>,
        trust_tx: mpsc::Sender<bool>,
        error: SharedError<ShipError>,
    ) -> Self {
        Self {
            ski,
            role,
            handle,
            data_tx,
            trust_tx,
            error,
        }
    }

    /// Queues a SPINE payload for the peer.
    ///
    /// The queue has capacity 1 and the send is bounded by the write
    /// deadline. A full queue past the deadline is a protocol failure, the
    /// connection is closed rather than the payload dropped silently.
    pub async fn send_data(&self, payload: serde_json::Value) -> Result<(), ShipError> {
        if self.handle.is_closed() {
            return Err(ShipError::ConnectionClosed);
        }

        match timeout(WRITE_TIMEOUT, self.data_tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ShipError::ChannelClosed),
            Err(_) => {
                tracing::warn!(ski = %self.ski, "Write queue blocked past the deadline, failing connection");
                self.handle.send_close_signal();
                Err(ShipError::TimedOut)
            }
        }
    }

    /// Signals a local trust decision to a connection waiting in the hello
    /// phase. `true` lets the handshake proceed, `false` aborts it.
    pub fn signal_trust(&self, trusted: bool) {
        // Capacity 1 and only the latest decision matters, a full queue
        // already carries one.
        drop(self.trust_tx.try_send(trusted));
    }

    /// The error that terminated this connection, if it terminated.
    pub fn error(&self) -> Option<&ShipError> {
        self.error.get()
    }
}
