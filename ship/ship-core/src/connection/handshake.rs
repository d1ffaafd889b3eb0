//! The SME handshake phases.
//!
//! Connection mode initialisation, hello (trust), protocol selection, pin
//! check and access methods. Each handler receives a message that already
//! passed framing, decides whether it is legal in the current state and
//! either advances the machine or returns the terminating error.

use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};

use hearth_wire::{
    AccessMethods, AccessMethodsRequest, ConnectionHello, ConnectionHelloPhase,
    ConnectionPinState, ControlMessage, MessageProtocolHandshake, MessageProtocolHandshakeError,
    PinState, ProtocolHandshakeType, ShipMessage,
};

use crate::{
    constants::{T_HELLO_INIT, T_HELLO_PROLONG_MAX},
    error::ShipError,
    types::ShipRole,
    SpineHandler,
};

use super::{ConnectionEvent, ShipConnection, SmeState};

impl<S, H> ShipConnection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: SpineHandler,
{
    /// Starts the connection mode initialisation. The client role speaks
    /// first, the server role waits for the mirrored init.
    pub(super) async fn begin_handshake(&mut self) -> Result<(), ShipError> {
        self.set_state(SmeState::CmiInitStart);

        match self.role {
            ShipRole::Client => {
                self.send_ship_message(ShipMessage::Init).await?;
                self.set_state(SmeState::CmiClientWait);
            }
            ShipRole::Server => self.set_state(SmeState::CmiServerWait),
        }

        Ok(())
    }

    pub(super) async fn handle_init(&mut self) -> Result<(), ShipError> {
        match self.state {
            SmeState::CmiClientWait => self.hello_init().await,
            SmeState::CmiServerWait => {
                self.send_ship_message(ShipMessage::Init).await?;
                self.hello_init().await
            }
            SmeState::CmiInitStart
            | SmeState::HelloReadyListen
            | SmeState::HelloPendingListen
            | SmeState::ProtClientListenChoice
            | SmeState::ProtServerListenProposal
            | SmeState::ProtServerListenConfirm
            | SmeState::PinCheckListen
            | SmeState::AccessMethodsRequest
            | SmeState::Complete
            | SmeState::Error
            | SmeState::Closed => Err(ShipError::UnexpectedMessage("init in wrong state")),
        }
    }

    pub(super) async fn handle_control(
        &mut self,
        control: ControlMessage,
    ) -> Result<(), ShipError> {
        match control {
            ControlMessage::Hello(hello) => self.handle_hello(hello).await,
            ControlMessage::ProtocolHandshake(handshake) => {
                self.handle_protocol_handshake(handshake).await
            }
            ControlMessage::ProtocolHandshakeError(error) => {
                self.handle_protocol_handshake_error(error).await
            }
            ControlMessage::PinState(pin_state) => self.handle_pin_state(pin_state).await,
            ControlMessage::AccessMethodsRequest(request) => {
                self.handle_access_methods_request(request).await
            }
            ControlMessage::AccessMethods(access_methods) => {
                self.handle_access_methods(access_methods).await
            }
        }
    }

    // ## Hello phase

    /// Enters the trust phase: a trusted side goes straight to `ready`, an
    /// untrusted one announces `pending` and asks the hub for an operator
    /// decision.
    async fn hello_init(&mut self) -> Result<(), ShipError> {
        self.hello_started = Some(Instant::now());

        if self.local_trust {
            self.send_ship_message(ShipMessage::Control(ControlMessage::Hello(
                ConnectionHello::ready(),
            )))
            .await?;
            self.set_state(SmeState::HelloReadyListen);
        } else {
            self.send_ship_message(ShipMessage::Control(ControlMessage::Hello(
                ConnectionHello::pending(millis(T_HELLO_INIT)),
            )))
            .await?;
            self.set_state(SmeState::HelloPendingListen);
            self.send_event(ConnectionEvent::PairingRequest {
                ski: self.remote.ski.clone(),
            });
        }

        Ok(())
    }

    async fn handle_hello(&mut self, hello: ConnectionHello) -> Result<(), ShipError> {
        if !matches!(
            self.state,
            SmeState::HelloReadyListen | SmeState::HelloPendingListen
        ) {
            return Err(ShipError::UnexpectedMessage("hello in wrong state"));
        }

        match hello.phase {
            ConnectionHelloPhase::Aborted => Err(ShipError::RemoteDeniedTrust),
            ConnectionHelloPhase::Ready => {
                self.remote_hello_ready = true;

                if self.state == SmeState::HelloReadyListen {
                    // Both sides ready, trust is established.
                    self.protocol_init().await
                } else {
                    // The peer is ready but we still wait for the operator.
                    Ok(())
                }
            }
            ConnectionHelloPhase::Pending => {
                if self.state == SmeState::HelloReadyListen
                    && hello.prolongation_request == Some(true)
                {
                    self.extend_hello_window();
                }
                Ok(())
            }
        }
    }

    /// The peer asked us to keep waiting. Granted as long as the total stays
    /// below the prolongation ceiling, otherwise the running timer simply
    /// fires.
    fn extend_hello_window(&mut self) {
        let Some(started) = self.hello_started else {
            return;
        };

        let remaining = T_HELLO_PROLONG_MAX.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            tracing::debug!(ski = %self.remote.ski, "Prolongation ceiling reached, not extending");
            return;
        }

        self.arm_timer(remaining.min(T_HELLO_INIT));
    }

    /// The operator trusted the peer while we were pending.
    pub(super) async fn hello_trust_granted(&mut self) -> Result<(), ShipError> {
        self.send_ship_message(ShipMessage::Control(ControlMessage::Hello(
            ConnectionHello::ready(),
        )))
        .await?;

        if self.remote_hello_ready {
            self.protocol_init().await
        } else {
            self.set_state(SmeState::HelloReadyListen);
            Ok(())
        }
    }

    pub(super) async fn send_hello_abort(&mut self) -> Result<(), ShipError> {
        self.send_ship_message(ShipMessage::Control(ControlMessage::Hello(
            ConnectionHello::aborted(),
        )))
        .await
    }

    // ## Protocol handshake phase

    /// Both sides observed `ready`: the client proposes, the server waits
    /// for the proposal.
    async fn protocol_init(&mut self) -> Result<(), ShipError> {
        match self.role {
            ShipRole::Client => {
                self.send_ship_message(ShipMessage::Control(ControlMessage::ProtocolHandshake(
                    MessageProtocolHandshake::announce_max(),
                )))
                .await?;
                self.set_state(SmeState::ProtClientListenChoice);
            }
            ShipRole::Server => self.set_state(SmeState::ProtServerListenProposal),
        }

        Ok(())
    }

    async fn handle_protocol_handshake(
        &mut self,
        handshake: MessageProtocolHandshake,
    ) -> Result<(), ShipError> {
        match self.state {
            SmeState::ProtClientListenChoice => {
                if handshake.handshake_type != ProtocolHandshakeType::Select
                    || !handshake.is_supported()
                {
                    return self
                        .abort_protocol_handshake(
                            MessageProtocolHandshakeError::SELECTION_MISMATCH,
                        )
                        .await;
                }

                // Acknowledge the selection and move on.
                self.send_ship_message(ShipMessage::Control(
                    ControlMessage::ProtocolHandshakeError(
                        MessageProtocolHandshakeError::NO_ERROR,
                    ),
                ))
                .await?;
                self.pin_init().await
            }
            SmeState::ProtServerListenProposal => {
                if handshake.handshake_type != ProtocolHandshakeType::AnnounceMax
                    || !handshake.is_supported()
                {
                    return self
                        .abort_protocol_handshake(
                            MessageProtocolHandshakeError::SELECTION_MISMATCH,
                        )
                        .await;
                }

                self.send_ship_message(ShipMessage::Control(ControlMessage::ProtocolHandshake(
                    MessageProtocolHandshake::select(),
                )))
                .await?;
                self.set_state(SmeState::ProtServerListenConfirm);
                Ok(())
            }
            SmeState::CmiInitStart
            | SmeState::CmiClientWait
            | SmeState::CmiServerWait
            | SmeState::HelloReadyListen
            | SmeState::HelloPendingListen
            | SmeState::ProtServerListenConfirm
            | SmeState::PinCheckListen
            | SmeState::AccessMethodsRequest
            | SmeState::Complete
            | SmeState::Error
            | SmeState::Closed => Err(ShipError::UnexpectedMessage(
                "protocol handshake in wrong state",
            )),
        }
    }

    async fn handle_protocol_handshake_error(
        &mut self,
        error: MessageProtocolHandshakeError,
    ) -> Result<(), ShipError> {
        if error.error != 0 {
            return Err(ShipError::UnexpectedMessage("peer aborted protocol handshake"));
        }

        if self.state == SmeState::ProtServerListenConfirm {
            self.pin_init().await
        } else {
            Err(ShipError::UnexpectedMessage(
                "protocol handshake acknowledgement in wrong state",
            ))
        }
    }

    async fn abort_protocol_handshake(
        &mut self,
        error: MessageProtocolHandshakeError,
    ) -> Result<(), ShipError> {
        drop(
            self.send_ship_message(ShipMessage::Control(
                ControlMessage::ProtocolHandshakeError(error),
            ))
            .await,
        );

        Err(ShipError::UnexpectedMessage("protocol selection mismatch"))
    }

    // ## Pin phase

    async fn pin_init(&mut self) -> Result<(), ShipError> {
        self.send_ship_message(ShipMessage::Control(ControlMessage::PinState(
            ConnectionPinState::none(),
        )))
        .await?;
        self.set_state(SmeState::PinCheckListen);
        Ok(())
    }

    async fn handle_pin_state(
        &mut self,
        pin_state: ConnectionPinState,
    ) -> Result<(), ShipError> {
        if self.state != SmeState::PinCheckListen {
            return Err(ShipError::UnexpectedMessage("pin state in wrong state"));
        }

        match pin_state.pin_state {
            PinState::None => self.access_methods_init().await,
            PinState::Required | PinState::Optional | PinState::PinOk => {
                Err(ShipError::UnsupportedPinState)
            }
        }
    }

    // ## Access methods phase

    async fn access_methods_init(&mut self) -> Result<(), ShipError> {
        self.send_ship_message(ShipMessage::Control(ControlMessage::AccessMethodsRequest(
            AccessMethodsRequest,
        )))
        .await?;
        self.set_state(SmeState::AccessMethodsRequest);
        Ok(())
    }

    async fn handle_access_methods_request(
        &mut self,
        _: AccessMethodsRequest,
    ) -> Result<(), ShipError> {
        if self.state != SmeState::AccessMethodsRequest {
            return Err(ShipError::UnexpectedMessage(
                "access methods request in wrong state",
            ));
        }

        let ship_id = self.local.ship_id.clone();
        self.send_ship_message(ShipMessage::Control(ControlMessage::AccessMethods(
            AccessMethods { id: Some(ship_id) },
        )))
        .await
    }

    async fn handle_access_methods(
        &mut self,
        access_methods: AccessMethods,
    ) -> Result<(), ShipError> {
        if self.state != SmeState::AccessMethodsRequest {
            return Err(ShipError::UnexpectedMessage("access methods in wrong state"));
        }

        let Some(ship_id) = access_methods.id else {
            return Err(ShipError::UnexpectedMessage("access methods without ship id"));
        };

        // A ShipID may be learned once. A different one behind the same
        // certificate is somebody else answering.
        match &self.remote.ship_id {
            Some(stored) if *stored != ship_id => {
                return Err(ShipError::IdentityMismatch("ship id changed"));
            }
            Some(_) => {}
            None => {
                self.remote.ship_id = Some(ship_id.clone());
            }
        }

        self.send_event(ConnectionEvent::ShipIdUpdate {
            ski: self.remote.ski.clone(),
            ship_id,
        });

        self.complete();
        Ok(())
    }

    /// The handshake is done, enter the data phase.
    fn complete(&mut self) {
        tracing::info!(ski = %self.remote.ski, role = %self.role, "SHIP handshake complete");

        self.set_state(SmeState::Complete);
        self.last_pong = Instant::now();
        self.ping_interval.reset();

        self.send_event(ConnectionEvent::Completed {
            ski: self.remote.ski.clone(),
        });
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
