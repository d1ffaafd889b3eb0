//! The inbound connection server.
//!
//! Listens for inbound sockets, runs the TLS + websocket upgrade (which
//! yields the peer's SKI) and hands the result to the hub for arbitration.

use std::sync::Arc;

use tokio::{net::TcpListener, time::timeout};
use tracing::{Instrument, Span};

use hearth_ship_core::{transport, SpineHandler};

use crate::{
    constants::ACCEPT_TIMEOUT,
    hub::{ConnectionsHub, SpineHandlerMaker},
};

/// Accepts inbound connections until the hub shuts down.
pub(crate) async fn inbound_server<H, F>(
    hub: Arc<ConnectionsHub<H, F>>,
    listener: TcpListener,
) where
    H: SpineHandler,
    F: SpineHandlerMaker<H>,
{
    tracing::info!(
        addr = ?listener.local_addr().ok(),
        "Starting inbound connection server"
    );

    loop {
        let accepted = tokio::select! {
            () = hub.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let Ok((stream, peer_addr)) = accepted else {
            continue;
        };

        tracing::debug!(%peer_addr, "Inbound socket, starting TLS upgrade");

        let hub = Arc::clone(&hub);
        tokio::spawn(
            async move {
                match timeout(ACCEPT_TIMEOUT, transport::accept(stream, hub.credentials())).await
                {
                    Ok(Ok((ws, ski))) => hub.inbound_established(ws, &ski),
                    Ok(Err(err)) => {
                        tracing::debug!(%peer_addr, "Inbound upgrade failed: {err}");
                    }
                    Err(_) => {
                        tracing::debug!(%peer_addr, "Inbound upgrade timed out");
                    }
                }
            }
            .instrument(Span::current()),
        );
    }
}
