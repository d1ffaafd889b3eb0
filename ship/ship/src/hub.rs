//! The connections hub.
//!
//! One instance per local service. It owns the only registry of live
//! connections, the pairing registry, the per-SKI backoff counters and the
//! `connection attempt running` flags. The mutex is held for map operations
//! only, never across I/O.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use hearth_ship_core::{
    transport::{self, ShipCredentials},
    ConnectionEvent, ConnectionStateDetail, LocalService, PairingState, ServiceDetails,
    ShipConnection, ShipErrorKind, ShipPeer, ShipRole, Ski, SpineHandler,
};

use crate::{
    constants::{CONNECTION_INITIATION_DELAY_RANGES, DIAL_TIMEOUT, SHUTDOWN_TIMEOUT},
    discovery::MdnsEntry,
    service::ServiceEvent,
};

/// Builds the SPINE handler for one freshly connected peer.
pub trait SpineHandlerMaker<H>:
    Fn(&ServiceDetails) -> H + Send + Sync + 'static
{
}

impl<T, H> SpineHandlerMaker<H> for T where T: Fn(&ServiceDetails) -> H + Send + Sync + 'static {}

/// Everything the hub guards with its one mutex.
struct HubState {
    /// At most one live connection per SKI.
    connections: HashMap<Ski, ShipPeer>,
    /// The pairing registry plus whatever discovery taught us about peers.
    remote_services: HashMap<Ski, ServiceDetails>,
    /// Failed attempts per SKI, selects the backoff delay range.
    connection_attempt_counter: HashMap<Ski, usize>,
    /// SKIs with a dial scheduled or in flight.
    connection_attempt_running: HashSet<Ski>,
    /// The latest discovery snapshot, address source for dials.
    visible: HashMap<Ski, MdnsEntry>,
}

/// The hub. Shared as `Arc`, everything on it is `&self`.
pub struct ConnectionsHub<H, F> {
    local: LocalService,
    credentials: ShipCredentials,
    /// Trust unknown inbound peers without an operator decision.
    auto_accept: bool,

    state: Mutex<HubState>,

    /// Cloned into every connection as its event sink.
    connection_events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Callbacks toward the facade's controller.
    service_events: mpsc::UnboundedSender<ServiceEvent>,

    spine_handler_maker: F,

    shutdown: CancellationToken,
    _handler: std::marker::PhantomData<fn() -> H>,
}

impl<H, F> ConnectionsHub<H, F>
where
    H: SpineHandler,
    F: SpineHandlerMaker<H>,
{
    /// Creates the hub and the receiving end of its connection event
    /// channel. The caller spawns [`ConnectionsHub::run_event_loop`] with it.
    pub(crate) fn new(
        local: LocalService,
        credentials: ShipCredentials,
        auto_accept: bool,
        service_events: mpsc::UnboundedSender<ServiceEvent>,
        spine_handler_maker: F,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (connection_events_tx, connection_events_rx) = mpsc::unbounded_channel();

        let hub = Arc::new(Self {
            local,
            credentials,
            auto_accept,
            state: Mutex::new(HubState {
                connections: HashMap::new(),
                remote_services: HashMap::new(),
                connection_attempt_counter: HashMap::new(),
                connection_attempt_running: HashSet::new(),
                visible: HashMap::new(),
            }),
            connection_events_tx,
            service_events,
            spine_handler_maker,
            shutdown: CancellationToken::new(),
            _handler: std::marker::PhantomData,
        });

        (hub, connection_events_rx)
    }

    pub(crate) fn credentials(&self) -> &ShipCredentials {
        &self.credentials
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ## Registry surface

    /// Installs or updates a SKI in the pairing registry. With `trust` a
    /// waiting connection is let through, otherwise an attempt is queued as
    /// soon as the peer is visible.
    pub fn register_remote_ski(self: &Arc<Self>, ski: &Ski, trust: bool) {
        tracing::debug!(%ski, trust, "Registering remote SKI");

        let waiting_peer = {
            let mut state = self.state.lock().unwrap();

            let entry = state
                .remote_services
                .entry(ski.clone())
                .or_insert_with(|| ServiceDetails::new(ski.clone()));
            entry.user_trust = trust;

            if trust {
                state.connections.get(ski).cloned()
            } else {
                None
            }
        };

        if !trust {
            return;
        }

        match waiting_peer {
            // A connection is suspended in the hello phase, wake it.
            Some(peer) => peer.signal_trust(true),
            // No connection yet: dial if discovery already knows the peer.
            None => self.try_schedule_connect(ski),
        }
    }

    /// Removes a SKI from the pairing registry and forces any live
    /// connection closed. No retry is scheduled.
    pub fn unregister_remote_ski(&self, ski: &Ski) {
        tracing::debug!(%ski, "Unregistering remote SKI");

        let peer = {
            let mut state = self.state.lock().unwrap();
            state.remote_services.remove(ski);
            state.connection_attempt_counter.remove(ski);
            state.connections.get(ski).cloned()
        };

        if let Some(peer) = peer {
            peer.signal_trust(false);
            peer.handle.send_close_signal();
        }

        self.send_service_event(ServiceEvent::ServicePairingDetailUpdate {
            ski: ski.clone(),
            detail: ConnectionStateDetail::new(PairingState::None),
        });
    }

    /// Closes the connection to `ski`, keeping the registration.
    pub fn disconnect_ski(&self, ski: &Ski, reason: &str) {
        let handle = {
            let state = self.state.lock().unwrap();
            state.connections.get(ski).map(|peer| peer.handle.clone())
        };

        if let Some(handle) = handle {
            tracing::info!(%ski, reason, "Disconnecting");
            handle.send_close_signal();
        }
    }

    /// Whether the operator has paired this SKI.
    pub fn is_ski_paired(&self, ski: &Ski) -> bool {
        let state = self.state.lock().unwrap();
        state
            .remote_services
            .get(ski)
            .is_some_and(|details| details.user_trust)
    }

    /// Whether a live connection to this SKI exists.
    pub fn is_ski_connected(&self, ski: &Ski) -> bool {
        let state = self.state.lock().unwrap();
        state
            .connections
            .get(ski)
            .is_some_and(|peer| !peer.handle.is_closed())
    }

    /// The registry entry for `ski`, if any.
    pub fn service_for_ski(&self, ski: &Ski) -> Option<ServiceDetails> {
        let state = self.state.lock().unwrap();
        state.remote_services.get(ski).cloned()
    }

    /// The current discovery snapshot.
    pub fn visible_remote_services(&self) -> Vec<MdnsEntry> {
        let state = self.state.lock().unwrap();
        state.visible.values().cloned().collect()
    }

    /// Queues a SPINE payload for a connected peer.
    pub async fn send_spine_data(
        &self,
        ski: &Ski,
        payload: serde_json::Value,
    ) -> Result<(), hearth_ship_core::ShipError> {
        let peer = {
            let state = self.state.lock().unwrap();
            state.connections.get(ski).cloned()
        };

        match peer {
            Some(peer) => peer.send_data(payload).await,
            None => Err(hearth_ship_core::ShipError::ConnectionClosed),
        }
    }

    // ## Shutdown

    /// Broadcasts close to every connection and blocks until all reported
    /// terminal, bounded by the shutdown timeout.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down connections hub");
        self.shutdown.cancel();

        let handles: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .connections
                .values()
                .map(|peer| peer.handle.clone())
                .collect()
        };

        for handle in &handles {
            handle.send_close_signal();
        }

        let all_closed =
            futures::future::join_all(handles.iter().map(|handle| handle.closed()));
        if timeout(SHUTDOWN_TIMEOUT, all_closed).await.is_err() {
            tracing::warn!("Not all connections reported terminal before the shutdown timeout");
        }
    }

    // ## Discovery

    pub(crate) fn handle_discovery_update(self: &Arc<Self>, entries: Vec<MdnsEntry>) {
        let candidates: Vec<Ski> = {
            let mut state = self.state.lock().unwrap();

            state.visible = entries
                .iter()
                .filter(|entry| entry.ski != self.local.ski)
                .map(|entry| (entry.ski.clone(), entry.clone()))
                .collect();

            // Visible, trusted, not connected, no attempt in flight.
            state
                .visible
                .keys()
                .filter(|ski| {
                    state
                        .remote_services
                        .get(*ski)
                        .is_some_and(ServiceDetails::is_trusted)
                        && !state.connections.contains_key(*ski)
                        && !state.connection_attempt_running.contains(*ski)
                })
                .cloned()
                .collect()
        };

        self.send_service_event(ServiceEvent::VisibleRemoteServicesUpdated(entries));

        for ski in candidates {
            self.try_schedule_connect(&ski);
        }
    }

    // ## Outbound attempts

    /// Schedules a dial for `ski` unless one is already running or the peer
    /// is not visible yet. The delay is drawn from the backoff table.
    pub(crate) fn try_schedule_connect(self: &Arc<Self>, ski: &Ski) {
        if self.is_shutting_down() {
            return;
        }

        let (host, port, delay) = {
            let mut state = self.state.lock().unwrap();

            if state.connections.contains_key(ski)
                || state.connection_attempt_running.contains(ski)
            {
                return;
            }

            let Some(entry) = state.visible.get(ski) else {
                tracing::debug!(%ski, "Peer not visible, waiting for discovery");
                return;
            };
            let (host, port) = (entry.host.clone(), entry.port);

            state.connection_attempt_running.insert(ski.clone());

            let counter = state
                .connection_attempt_counter
                .get(ski)
                .copied()
                .unwrap_or(0);

            (host, port, connection_initiation_delay(counter))
        };

        tracing::debug!(%ski, ?delay, "Scheduling connection attempt");
        self.send_service_event(ServiceEvent::ServicePairingDetailUpdate {
            ski: ski.clone(),
            detail: ConnectionStateDetail::new(PairingState::Queued),
        });

        let hub = Arc::clone(self);
        let ski = ski.clone();
        let span = tracing::info_span!("connect_attempt", %ski);

        tokio::spawn(
            async move {
                sleep(delay).await;
                if hub.is_shutting_down() {
                    return;
                }

                hub.send_service_event(ServiceEvent::ServicePairingDetailUpdate {
                    ski: ski.clone(),
                    detail: ConnectionStateDetail::new(PairingState::Initiated),
                });

                match timeout(
                    DIAL_TIMEOUT,
                    transport::connect(&host, port, &ski, hub.credentials()),
                )
                .await
                {
                    Ok(Ok(ws)) => hub.outbound_established(ws, &ski),
                    Ok(Err(err)) => hub.attempt_failed(&ski, &err.to_string()),
                    Err(_) => hub.attempt_failed(&ski, "dial timed out"),
                }
            }
            .instrument(span),
        );
    }

    fn attempt_failed(&self, ski: &Ski, reason: &str) {
        tracing::debug!(%ski, reason, "Connection attempt failed");

        {
            let mut state = self.state.lock().unwrap();
            state.connection_attempt_running.remove(ski);
            increase_connection_attempt_counter(&mut state.connection_attempt_counter, ski);
        }

        // The next discovery snapshot or registration retries.
        self.send_service_event(ServiceEvent::ServicePairingDetailUpdate {
            ski: ski.clone(),
            detail: ConnectionStateDetail::with_error(PairingState::None, ShipErrorKind::Transport),
        });
    }

    /// An outbound dial produced a websocket. Registers it unless an inbound
    /// connection won the race in the meantime.
    fn outbound_established<S>(self: &Arc<Self>, ws: WebSocketStream<S>, ski: &Ski)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        state.connection_attempt_running.remove(ski);

        if let Some(existing) = state.connections.get(ski) {
            let keep_existing = match existing.role {
                // Simultaneous dial race: the SKI comparison decides.
                ShipRole::Server => keep_inbound(&self.local.ski, ski),
                // A connection we dialled already exists, ours is a duplicate.
                ShipRole::Client => true,
            };

            if keep_existing {
                tracing::debug!(%ski, "Existing connection wins the tie-break, dropping dial");
                return;
            }

            tracing::debug!(%ski, "Outbound connection wins the tie-break, closing inbound");
            existing.handle.send_close_signal();
        }

        self.spawn_connection(&mut state, ShipRole::Client, ski, ws);
    }

    /// An accepted inbound websocket for `ski` arrived from the listener.
    pub(crate) fn inbound_established<S>(self: &Arc<Self>, ws: WebSocketStream<S>, ski: &Ski)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if *ski == self.local.ski {
            tracing::warn!("Dropping inbound connection with our own SKI");
            return;
        }

        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.connections.get(ski) {
            let keep_new = match existing.role {
                // Simultaneous dial race: the SKI comparison decides.
                ShipRole::Client => keep_inbound(&self.local.ski, ski),
                // There already is an inbound connection, this one is a
                // duplicate.
                ShipRole::Server => false,
            };

            if !keep_new {
                tracing::debug!(%ski, "Existing connection wins the tie-break, rejecting inbound");
                return;
            }

            tracing::debug!(%ski, "Inbound connection wins the tie-break, closing the other");
            existing.handle.send_close_signal();
        } else if state.connection_attempt_running.contains(ski)
            && !keep_inbound(&self.local.ski, ski)
        {
            // Our own dial is still in flight and will win, reject this one.
            tracing::debug!(%ski, "Outbound attempt in flight wins the tie-break, rejecting inbound");
            return;
        }

        self.spawn_connection(&mut state, ShipRole::Server, ski, ws);
    }

    fn spawn_connection<S>(
        self: &Arc<Self>,
        state: &mut HubState,
        role: ShipRole,
        ski: &Ski,
        ws: WebSocketStream<S>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let details = state
            .remote_services
            .entry(ski.clone())
            .or_insert_with(|| {
                let mut details = ServiceDetails::new(ski.clone());
                details.auto_accept = self.auto_accept;
                details
            })
            .clone();

        let handler = (self.spine_handler_maker)(&details);
        let (connection, peer) = ShipConnection::new(
            role,
            self.local.clone(),
            details,
            ws,
            handler,
            self.connection_events_tx.clone(),
        );

        state.connections.insert(ski.clone(), peer);

        let span = tracing::error_span!("connection", %ski, %role);
        tokio::spawn(connection.run().instrument(span));
    }

    // ## Connection events

    /// Routes events from every connection task.
    ///
    /// After shutdown it keeps draining so the disconnect of every closing
    /// connection still reaches the facade, bounded by the shutdown timeout.
    pub(crate) async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => {
                    let Some(event) = event else { return };
                    self.handle_connection_event(event);
                }
                () = self.cancelled() => break,
            }
        }

        loop {
            if self.state.lock().unwrap().connections.is_empty() {
                return;
            }

            match timeout(SHUTDOWN_TIMEOUT, events.recv()).await {
                Ok(Some(event)) => self.handle_connection_event(event),
                Ok(None) | Err(_) => return,
            }
        }
    }

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { ski, detail } => {
                self.send_service_event(ServiceEvent::ServicePairingDetailUpdate { ski, detail });
            }
            ConnectionEvent::PairingRequest { ski } => {
                // Make sure the registry knows the peer so the operator can
                // act on the request.
                let auto_accept = {
                    let mut state = self.state.lock().unwrap();
                    state
                        .remote_services
                        .entry(ski.clone())
                        .or_insert_with(|| ServiceDetails::new(ski.clone()))
                        .auto_accept
                };

                if auto_accept {
                    self.register_remote_ski(&ski, true);
                }
            }
            ConnectionEvent::ShipIdUpdate { ski, ship_id } => {
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(details) = state.remote_services.get_mut(&ski) {
                        details.ship_id = Some(ship_id.clone());
                    }
                }

                self.send_service_event(ServiceEvent::ServiceShipIdUpdate { ski, ship_id });
            }
            ConnectionEvent::Completed { ski } => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.connection_attempt_counter.remove(&ski);
                }

                self.send_service_event(ServiceEvent::RemoteSkiConnected(ski));
            }
            ConnectionEvent::Closed { ski, error } => {
                {
                    let mut state = self.state.lock().unwrap();

                    // Only drop the registry entry if it still belongs to the
                    // closed task; a tie-break may already have replaced it.
                    if state
                        .connections
                        .get(&ski)
                        .is_some_and(|peer| peer.handle.is_closed())
                    {
                        state.connections.remove(&ski);
                    }
                    state.connection_attempt_running.remove(&ski);

                    if matches!(
                        error,
                        Some(ShipErrorKind::Transport | ShipErrorKind::Timeout)
                    ) {
                        increase_connection_attempt_counter(
                            &mut state.connection_attempt_counter,
                            &ski,
                        );
                    }
                }

                self.send_service_event(ServiceEvent::RemoteSkiDisconnected(ski));
            }
        }
    }

    fn send_service_event(&self, event: ServiceEvent) {
        drop(self.service_events.send(event));
    }
}

/// The simultaneous-dial tie-break: the side with the lexicographically
/// smaller SKI takes the server role, so its inbound connection survives.
fn keep_inbound(local: &Ski, remote: &Ski) -> bool {
    local < remote
}

fn increase_connection_attempt_counter(counters: &mut HashMap<Ski, usize>, ski: &Ski) {
    *counters.entry(ski.clone()).or_insert(0) += 1;
}

/// Draws the delay before the next attempt, uniform within the range the
/// counter selects.
fn connection_initiation_delay(counter: usize) -> Duration {
    let index = counter.min(CONNECTION_INITIATION_DELAY_RANGES.len() - 1);
    let (min, max) = CONNECTION_INITIATION_DELAY_RANGES[index];

    Duration::from_millis(rand::thread_rng().gen_range(min * 1000..=max * 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_drawn_from_the_counters_range() {
        for (counter, expected) in [(0, (0, 10)), (1, (10, 20)), (2, (120, 300))] {
            for _ in 0..32 {
                let delay = connection_initiation_delay(counter);
                assert!(delay >= Duration::from_secs(expected.0), "counter {counter}");
                assert!(delay <= Duration::from_secs(expected.1), "counter {counter}");
            }
        }
    }

    #[test]
    fn delay_range_saturates_at_the_last_entry() {
        for counter in 2..12 {
            let delay = connection_initiation_delay(counter);
            assert!(delay >= Duration::from_secs(120));
            assert!(delay <= Duration::from_secs(300));
        }
    }

    #[test]
    fn attempt_counter_counts_failures() {
        let mut counters = HashMap::new();
        let ski = Ski::parse(&"ab".repeat(20)).unwrap();

        increase_connection_attempt_counter(&mut counters, &ski);
        assert_eq!(counters[&ski], 1);
        increase_connection_attempt_counter(&mut counters, &ski);
        assert_eq!(counters[&ski], 2);

        counters.remove(&ski);
        assert!(!counters.contains_key(&ski));
    }

    #[test]
    fn tie_break_gives_the_smaller_ski_the_server_role() {
        let aaaa = Ski::parse(&"aa".repeat(20)).unwrap();
        let bbbb = Ski::parse(&"bb".repeat(20)).unwrap();

        // Local "aaaa" keeps the inbound connection (acts as server).
        assert!(keep_inbound(&aaaa, &bbbb));
        // Local "bbbb" keeps its outbound dial (acts as client).
        assert!(!keep_inbound(&bbbb, &aaaa));
    }

    type TestHandler = tower::util::BoxService<hearth_ship_core::SpineData, (), tower::BoxError>;
    type TestMaker = fn(&ServiceDetails) -> TestHandler;

    fn test_handler(_details: &ServiceDetails) -> TestHandler {
        tower::util::BoxService::new(tower::service_fn(
            |_data: hearth_ship_core::SpineData| async move { Ok::<(), tower::BoxError>(()) },
        ))
    }

    fn test_credentials() -> ShipCredentials {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["hearth.test".to_owned()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        ShipCredentials::new(
            vec![cert.der().clone()],
            tokio_rustls::rustls::pki_types::PrivateKeyDer::try_from(key.serialize_der())
                .unwrap(),
        )
        .unwrap()
    }

    /// A peer that completes TCP, TLS and the websocket upgrade but never
    /// sends its connection mode init: the dial succeeds, the handshake
    /// deadline fires, and the failure must land in the backoff counter.
    #[tokio::test]
    async fn handshake_timeout_backs_off_the_next_attempt() {
        let credentials = test_credentials();
        let local = LocalService {
            ski: credentials.local_ski().unwrap(),
            ship_id: "shipid-local".to_owned(),
            device_type: "EnergyManagementSystem".to_owned(),
        };

        let (service_events_tx, mut service_events) = mpsc::unbounded_channel();
        let maker: TestMaker = test_handler;
        let (hub, connection_events) = ConnectionsHub::new(
            local,
            credentials,
            false,
            service_events_tx,
            maker,
        );
        tokio::spawn(Arc::clone(&hub).run_event_loop(connection_events));

        let silent_credentials = test_credentials();
        let silent_ski = silent_credentials.local_ski().unwrap();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let upgraded = transport::accept(stream, &silent_credentials).await.unwrap();

            let _hold_open = upgraded;
            sleep(Duration::from_secs(3600)).await;
        });

        hub.register_remote_ski(&silent_ski, true);
        hub.handle_discovery_update(vec![MdnsEntry {
            ski: silent_ski.clone(),
            identifier: "Demo-HEMS-0001".to_owned(),
            path: "/ship/".to_owned(),
            register: false,
            brand: "Demo".to_owned(),
            model: "HEMS".to_owned(),
            device_type: "EnergyManagementSystem".to_owned(),
            host: "127.0.0.1".to_owned(),
            port,
        }]);

        // Attempt 0 dials within [0, 10]s, the handshake deadline adds 10s.
        let deadline = Duration::from_secs(60);

        let detail = timeout(deadline, async {
            loop {
                let event = service_events.recv().await.expect("event channel closed");
                if let ServiceEvent::ServicePairingDetailUpdate { ski, detail } = event {
                    if ski == silent_ski && detail.state == PairingState::Timeout {
                        return detail;
                    }
                }
            }
        })
        .await
        .expect("no timeout detail observed");
        assert_eq!(detail.error, Some(ShipErrorKind::Timeout));

        timeout(deadline, async {
            loop {
                let event = service_events.recv().await.expect("event channel closed");
                if matches!(&event, ServiceEvent::RemoteSkiDisconnected(ski) if *ski == silent_ski)
                {
                    return;
                }
            }
        })
        .await
        .expect("no disconnect observed");

        // The failed handshake counts against the peer and moves the next
        // attempt into the second delay range.
        let counter = {
            let state = hub.state.lock().unwrap();
            state.connection_attempt_counter[&silent_ski]
        };
        assert_eq!(counter, 1);

        let next_delay = connection_initiation_delay(counter);
        assert!(next_delay >= Duration::from_secs(10));
        assert!(next_delay <= Duration::from_secs(20));
    }
}
