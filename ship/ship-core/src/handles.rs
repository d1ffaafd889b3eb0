//! Connection handles.
//!
//! A [`ConnectionGuard`] lives inside the connection task and a
//! [`ConnectionHandle`] is held by the hub. Close requests and the terminal
//! signal are separate tokens: asking a connection to close is not the same
//! as the connection being gone, and hub shutdown has to wait for the
//! latter.

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Builds the linked guard/handle pair for one connection.
pub fn connection_handles() -> (ConnectionGuard, ConnectionHandle) {
    let close_request = CancellationToken::new();
    let closed = CancellationToken::new();

    (
        ConnectionGuard {
            close_request: close_request.clone(),
            closed: closed.clone(),
        },
        ConnectionHandle {
            close_request,
            closed,
        },
    )
}

/// The task side.
pub struct ConnectionGuard {
    close_request: CancellationToken,
    closed: CancellationToken,
}

impl ConnectionGuard {
    /// Resolves when the hub asked this connection to close.
    pub fn should_shutdown(&self) -> WaitForCancellationFutureOwned {
        self.close_request.clone().cancelled_owned()
    }

    /// Tell the corresponding [`ConnectionHandle`]s that this connection is
    /// closed. Also runs on [`Drop::drop`], so the signal cannot be missed.
    pub fn connection_closed(&self) {
        self.closed.cancel();
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// The hub side: close signalling and liveness checks.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    close_request: CancellationToken,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Resolves once the connection task reported terminal.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }

    /// Checks if this connection reported terminal.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Sends the signal to the connection task to disconnect.
    pub fn send_close_signal(&self) {
        self.close_request.cancel();
    }
}
