//! Discovery adapter.
//!
//! The mDNS transport itself lives outside this crate, it only has to
//! deliver snapshots of the currently visible `_ship._tcp` services. The
//! adapter filters them against the pairing registry and pokes the hub to
//! dial trusted peers it is not connected to.

use std::sync::Arc;

use tokio::sync::mpsc;

use hearth_ship_core::{SpineHandler, Ski};

use crate::hub::{ConnectionsHub, SpineHandlerMaker};

/// One visible `_ship._tcp` service, assembled from its mDNS TXT records
/// and resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsEntry {
    /// TXT `ski`.
    pub ski: Ski,
    /// TXT `id`, the peer's announced identifier.
    pub identifier: String,
    /// TXT `path`, normally `/ship/`.
    pub path: String,
    /// TXT `register`: the peer auto-accepts registrations.
    pub register: bool,
    /// TXT `brand`.
    pub brand: String,
    /// TXT `model`.
    pub model: String,
    /// TXT `type`.
    pub device_type: String,
    /// Resolved host (address literal or hostname).
    pub host: String,
    /// Resolved port.
    pub port: u16,
}

/// Consumes visibility snapshots until the channel closes or the hub shuts
/// down.
pub(crate) async fn discovery_task<H, F>(
    hub: Arc<ConnectionsHub<H, F>>,
    mut entries_rx: mpsc::Receiver<Vec<MdnsEntry>>,
) where
    H: SpineHandler,
    F: SpineHandlerMaker<H>,
{
    loop {
        tokio::select! {
            () = hub.cancelled() => return,
            entries = entries_rx.recv() => {
                let Some(entries) = entries else {
                    tracing::debug!("Discovery channel closed");
                    return;
                };

                hub.handle_discovery_update(entries);
            }
        }
    }
}
