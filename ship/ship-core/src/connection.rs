//! The SHIP connection task.
//!
//! This module handles one peer from the first CMI byte to the terminal
//! state: it drives the SME handshake, forwards SPINE payloads in both
//! directions during the data phase and keeps the websocket alive with
//! pings. The task owns the websocket exclusively; the hub talks to it
//! through the [`ShipPeer`] handle and listens on a [`ConnectionEvent`]
//! channel.

use std::{pin::Pin, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{sleep, timeout, Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};
use tower::ServiceExt;

use hearth_wire::{ConnectionClose, ConnectionClosePhase, ShipData, ShipMessage, SHIP_PROTOCOL_ID};

use crate::{
    client::ShipPeer,
    constants::{MAX_HANDSHAKE_MESSAGE_SIZE, PING_INTERVAL, PONG_TIMEOUT, WRITE_TIMEOUT},
    error::{SharedError, ShipError, ShipErrorKind},
    handles::{connection_handles, ConnectionGuard},
    types::{ConnectionStateDetail, LocalService, ServiceDetails, ShipRole, Ski},
    SpineData, SpineHandler,
};

mod handshake;
mod state;

pub use state::SmeState;

/// What a connection reports back to the hub.
///
/// The connection never holds a reference to the hub, this channel is its
/// only way back, which keeps the ownership one-directional.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The observable pairing state changed.
    StateChanged {
        ski: Ski,
        detail: ConnectionStateDetail,
    },
    /// An untrusted peer is waiting in hello-pending for an operator
    /// decision.
    PairingRequest { ski: Ski },
    /// The peer's ShipID was learned or confirmed during access methods.
    ShipIdUpdate { ski: Ski, ship_id: String },
    /// The handshake finished, the connection is in the data phase.
    Completed { ski: Ski },
    /// The connection reached a terminal state and its task is exiting.
    Closed {
        ski: Ski,
        error: Option<ShipErrorKind>,
    },
}

/// A connection to one SHIP peer.
pub struct ShipConnection<S, H> {
    /// Our SHIP role for this connection.
    role: ShipRole,
    /// The local service identity.
    local: LocalService,
    /// Our working copy of the remote service. The hub owns the canonical
    /// one and is updated through events.
    remote: ServiceDetails,

    /// The websocket. All reads and writes happen on this task.
    ws: WebSocketStream<S>,

    /// The current SME state.
    state: SmeState,
    /// The handshake deadline. Always allocated, only polled while armed.
    handshake_timer: Pin<Box<Sleep>>,
    timer_armed: bool,
    /// When the hello phase started, bounds prolongations.
    hello_started: Option<Instant>,

    /// Whether the local side currently trusts the peer.
    local_trust: bool,
    /// The peer has sent hello `ready`.
    remote_hello_ready: bool,

    /// Local trust decisions from the hub.
    trust_rx: mpsc::Receiver<bool>,
    trust_closed: bool,
    /// Outgoing SPINE payloads. Capacity 1, senders block against it.
    data_rx: mpsc::Receiver<serde_json::Value>,

    /// Where incoming SPINE payloads go.
    spine_handler: H,
    /// The event sink into the hub.
    events: mpsc::UnboundedSender<ConnectionEvent>,

    /// Close signalling shared with the [`ShipPeer`] handle.
    guard: ConnectionGuard,
    /// The error slot shared with the [`ShipPeer`] handle.
    error: SharedError<ShipError>,

    /// Keepalive pacing for the data phase.
    ping_interval: Interval,
    last_pong: Instant,
}

impl<S, H> ShipConnection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: SpineHandler,
{
    /// Creates the connection task state and the [`ShipPeer`] handle for it.
    ///
    /// The caller spawns [`ShipConnection::run`] on its own task.
    pub fn new(
        role: ShipRole,
        local: LocalService,
        remote: ServiceDetails,
        ws: WebSocketStream<S>,
        spine_handler: H,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> (Self, ShipPeer) {
        let (data_tx, data_rx) = mpsc::channel(1);
        let (trust_tx, trust_rx) = mpsc::channel(1);
        let (guard, handle) = connection_handles();
        let error = SharedError::new();

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let local_trust = remote.is_trusted();

        let peer = ShipPeer::new(
            remote.ski.clone(),
            role,
            handle,
            data_tx,
            trust_tx,
            error.clone(),
        );

        let connection = Self {
            role,
            local,
            remote,
            ws,
            state: SmeState::CmiInitStart,
            handshake_timer: Box::pin(sleep(Duration::ZERO)),
            timer_armed: false,
            hello_started: None,
            local_trust,
            remote_hello_ready: false,
            trust_rx,
            trust_closed: false,
            data_rx,
            spine_handler,
            events,
            guard,
            error,
            ping_interval,
            last_pong: Instant::now(),
        };

        (connection, peer)
    }

    /// Runs the connection to its terminal state. Shutdown happens exactly
    /// once, on every exit path of this function.
    pub async fn run(mut self) {
        let result = self.drive().await;

        let error = match result {
            Ok(()) => {
                tracing::debug!(ski = %self.remote.ski, "Connection closed");
                None
            }
            Err(err) => {
                tracing::debug!(ski = %self.remote.ski, "Connection failed: {err}");

                let kind = err.kind();
                self.send_event(ConnectionEvent::StateChanged {
                    ski: self.remote.ski.clone(),
                    detail: state::error_detail(kind),
                });
                if !self.error.set(err) {
                    tracing::debug!("Error slot already contains an error");
                }

                // Best effort courtesy close, the peer is not obliged to read it.
                drop(timeout(Duration::from_secs(1), self.ws.close(None)).await);

                Some(kind)
            }
        };

        self.state = if error.is_some() {
            SmeState::Error
        } else {
            SmeState::Closed
        };

        // Terminal first, then the event: whoever reacts to the event must
        // already observe the connection as closed.
        self.guard.connection_closed();
        self.send_event(ConnectionEvent::Closed {
            ski: self.remote.ski.clone(),
            error,
        });
    }

    async fn drive(&mut self) -> Result<(), ShipError> {
        self.begin_handshake().await?;

        loop {
            if self.state == SmeState::Closed {
                return Ok(());
            }

            tokio::select! {
                biased;
                () = self.guard.should_shutdown() => {
                    return self.orderly_close().await;
                }
                () = &mut self.handshake_timer, if self.timer_armed => {
                    return self.handle_timer_fired().await;
                }
                trust = self.trust_rx.recv(), if !self.trust_closed => {
                    match trust {
                        Some(trusted) => self.handle_trust_update(trusted).await?,
                        None => self.trust_closed = true,
                    }
                }
                message = self.ws.next() => {
                    match message {
                        Some(message) => self.handle_ws_message(message?).await?,
                        None => return Err(ShipError::ConnectionClosed),
                    }
                }
                _ = self.ping_interval.tick(), if self.state == SmeState::Complete => {
                    self.keepalive().await?;
                }
                payload = self.data_rx.recv(), if self.state == SmeState::Complete => {
                    match payload {
                        Some(payload) => self.send_spine_data(payload).await?,
                        None => return Err(ShipError::ChannelClosed),
                    }
                }
            }
        }
    }

    /// Moves to `state`, arms or disarms the handshake deadline for it and
    /// reports the new observable detail.
    fn set_state(&mut self, state: SmeState) {
        tracing::trace!(ski = %self.remote.ski, ?state, "SME transition");
        self.state = state;

        match state.timeout() {
            Some(duration) => self.arm_timer(duration),
            None => self.timer_armed = false,
        }

        self.send_event(ConnectionEvent::StateChanged {
            ski: self.remote.ski.clone(),
            detail: state.detail(),
        });
    }

    fn arm_timer(&mut self, duration: Duration) {
        self.handshake_timer
            .as_mut()
            .reset(Instant::now() + duration);
        self.timer_armed = true;
    }

    fn send_event(&self, event: ConnectionEvent) {
        // The hub going away mid-shutdown is fine.
        drop(self.events.send(event));
    }

    /// A fired deadline is a protocol failure for every state that arms one.
    async fn handle_timer_fired(&mut self) -> Result<(), ShipError> {
        tracing::debug!(ski = %self.remote.ski, state = ?self.state, "Handshake deadline fired");

        if matches!(
            self.state,
            SmeState::HelloReadyListen | SmeState::HelloPendingListen
        ) {
            // Tell the peer we are giving up on the trust phase.
            drop(self.send_hello_abort().await);
        }

        Err(ShipError::HandshakeTimeout)
    }

    async fn handle_trust_update(&mut self, trusted: bool) -> Result<(), ShipError> {
        tracing::debug!(ski = %self.remote.ski, trusted, "Local trust update");

        if !trusted {
            if matches!(
                self.state,
                SmeState::HelloReadyListen | SmeState::HelloPendingListen
            ) {
                drop(self.send_hello_abort().await);
            }
            return Err(ShipError::TrustWithdrawn);
        }

        self.local_trust = true;
        if self.state == SmeState::HelloPendingListen {
            self.hello_trust_granted().await?;
        }
        Ok(())
    }

    async fn handle_ws_message(&mut self, message: WsMessage) -> Result<(), ShipError> {
        match message {
            WsMessage::Binary(frame) => {
                if self.state != SmeState::Complete && frame.len() > MAX_HANDSHAKE_MESSAGE_SIZE {
                    return Err(ShipError::FrameTooLarge(frame.len()));
                }

                let message = ShipMessage::decode(&frame)?;
                tracing::debug!(ski = %self.remote.ski, name = message.name(), "Received message");
                self.handle_ship_message(message).await
            }
            WsMessage::Ping(payload) => {
                self.send_ws_message(WsMessage::Pong(payload)).await
            }
            WsMessage::Pong(_) => {
                self.last_pong = Instant::now();
                Ok(())
            }
            WsMessage::Close(_) => Err(ShipError::ConnectionClosed),
            WsMessage::Text(_) => Err(ShipError::UnexpectedMessage("text frame")),
            WsMessage::Frame(_) => Err(ShipError::UnexpectedMessage("raw frame")),
        }
    }

    async fn handle_ship_message(&mut self, message: ShipMessage) -> Result<(), ShipError> {
        match message {
            ShipMessage::Init => self.handle_init().await,
            ShipMessage::Control(control) => self.handle_control(control).await,
            ShipMessage::Data(data) => self.handle_data(data).await,
            ShipMessage::End(close) => self.handle_end(close).await,
        }
    }

    async fn handle_data(&mut self, data: ShipData) -> Result<(), ShipError> {
        if self.state != SmeState::Complete {
            return Err(ShipError::UnexpectedMessage("data during handshake"));
        }

        if data.data.header.protocol_id != SHIP_PROTOCOL_ID {
            return Err(ShipError::UnexpectedMessage("unknown data protocol id"));
        }

        self.spine_handler
            .ready()
            .await?
            .call(SpineData {
                ski: self.remote.ski.clone(),
                payload: data.data.payload,
            })
            .await?;

        Ok(())
    }

    async fn handle_end(&mut self, close: ConnectionClose) -> Result<(), ShipError> {
        if self.state != SmeState::Complete {
            return Err(ShipError::UnexpectedMessage("end during handshake"));
        }

        match close.phase {
            ConnectionClosePhase::Announce => {
                tracing::debug!(ski = %self.remote.ski, "Peer announced close");
                drop(
                    self.send_ship_message(ShipMessage::End(ConnectionClose::confirm()))
                        .await,
                );
                drop(timeout(Duration::from_secs(1), self.ws.close(None)).await);
                self.set_state(SmeState::Closed);
                Ok(())
            }
            ConnectionClosePhase::Confirm => {
                Err(ShipError::UnexpectedMessage("unsolicited close confirm"))
            }
        }
    }

    /// The SHIP close procedure: announce the end, close the websocket with
    /// a normal closure, report terminal. Calling this twice is a no-op
    /// because the state is already [`SmeState::Closed`].
    async fn orderly_close(&mut self) -> Result<(), ShipError> {
        if self.state == SmeState::Closed {
            return Ok(());
        }

        if self.state == SmeState::Complete {
            tracing::debug!(ski = %self.remote.ski, "Closing connection");
            drop(
                self.send_ship_message(ShipMessage::End(ConnectionClose::announce()))
                    .await,
            );
            drop(timeout(Duration::from_secs(1), self.ws.close(None)).await);
            self.set_state(SmeState::Closed);
            return Ok(());
        }

        // Cancelled mid-handshake: the peer never completed in time.
        Err(ShipError::HandshakeTimeout)
    }

    async fn keepalive(&mut self) -> Result<(), ShipError> {
        if self.last_pong.elapsed() > PONG_TIMEOUT {
            tracing::debug!(ski = %self.remote.ski, "Peer stopped answering pings");
            return Err(ShipError::TimedOut);
        }

        self.send_ws_message(WsMessage::Ping(Vec::new())).await
    }

    async fn send_spine_data(&mut self, payload: serde_json::Value) -> Result<(), ShipError> {
        self.send_ship_message(ShipMessage::Data(ShipData::new(payload)))
            .await
    }

    /// Sends a SHIP frame with the write deadline applied, so the task never
    /// gets stuck against a peer that stopped reading.
    async fn send_ship_message(&mut self, message: ShipMessage) -> Result<(), ShipError> {
        tracing::debug!(ski = %self.remote.ski, name = message.name(), "Sending message");

        let frame = message.encode()?;
        self.send_ws_message(WsMessage::Binary(frame)).await
    }

    async fn send_ws_message(&mut self, message: WsMessage) -> Result<(), ShipError> {
        timeout(WRITE_TIMEOUT, self.ws.send(message))
            .await
            .map_err(|_| ShipError::TimedOut)?
            .map_err(ShipError::from)
    }
}
