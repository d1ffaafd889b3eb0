//! The service facade.
//!
//! [`ShipService`] is the one type a controller embeds: it owns the hub,
//! starts the listener, the discovery adapter and the event routing, and
//! exposes the pairing surface. Asynchronous callbacks arrive as
//! [`ServiceEvent`]s on the channel returned by [`ShipService::new`].

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use hearth_ship_core::{
    transport::{bind_listener, ShipCredentials},
    ConnectionEvent, ConnectionStateDetail, LocalService, ShipError, SpineHandler, Ski,
};

use crate::{
    config::{InvalidServiceConfig, ServiceConfig},
    discovery::{discovery_task, MdnsEntry},
    hub::{ConnectionsHub, SpineHandlerMaker},
    inbound::inbound_server,
};

/// Asynchronous notifications toward the controller.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A connection to this SKI reached the data phase.
    RemoteSkiConnected(Ski),
    /// The connection to this SKI terminated. Every connected SKI gets
    /// exactly one of these.
    RemoteSkiDisconnected(Ski),
    /// A peer's observable pairing state changed.
    ServicePairingDetailUpdate {
        ski: Ski,
        detail: ConnectionStateDetail,
    },
    /// A peer's ShipID was learned or confirmed.
    ServiceShipIdUpdate { ski: Ski, ship_id: String },
    /// The set of services visible via discovery changed.
    VisibleRemoteServicesUpdated(Vec<MdnsEntry>),
}

/// An installed use case, opaque to the SHIP layer.
///
/// Only the entity-typed registration form exists, a use case without its
/// entity is meaningless to controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseCaseRegistration {
    pub entity_type: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] InvalidServiceConfig),
    #[error("the service was already started")]
    AlreadyStarted,
    #[error("ship error: {0}")]
    Ship(#[from] ShipError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The public surface toward controllers.
pub struct ShipService<H, F> {
    config: ServiceConfig,
    local: LocalService,
    hub: Arc<ConnectionsHub<H, F>>,

    /// Moved out by [`ShipService::start`].
    startup: Mutex<Option<StartupState>>,
    use_cases: Mutex<Vec<UseCaseRegistration>>,
}

struct StartupState {
    connection_events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    discovery_rx: mpsc::Receiver<Vec<MdnsEntry>>,
}

impl<H, F> ShipService<H, F>
where
    H: SpineHandler,
    F: SpineHandlerMaker<H>,
{
    /// Builds the service. `discovery_rx` delivers visibility snapshots from
    /// whatever mDNS transport the application uses; `spine_handler_maker`
    /// builds the application's SPINE endpoint for each connected peer.
    ///
    /// Returns the service plus the controller's event channel.
    pub fn new(
        config: ServiceConfig,
        credentials: ShipCredentials,
        discovery_rx: mpsc::Receiver<Vec<MdnsEntry>>,
        spine_handler_maker: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceEvent>), ServiceError> {
        let local = LocalService {
            ski: credentials.local_ski()?,
            ship_id: config.ship_id(),
            device_type: config.device_type.clone(),
        };

        tracing::info!(ski = %local.ski, ship_id = %local.ship_id, "Local SHIP service");

        let (service_events_tx, service_events_rx) = mpsc::unbounded_channel();
        let (hub, connection_events_rx) = ConnectionsHub::new(
            local.clone(),
            credentials,
            config.register_auto_accept,
            service_events_tx,
            spine_handler_maker,
        );

        let service = Self {
            config,
            local,
            hub,
            startup: Mutex::new(Some(StartupState {
                connection_events_rx,
                discovery_rx,
            })),
            use_cases: Mutex::new(Vec::new()),
        };

        Ok((service, service_events_rx))
    }

    /// Binds the listener and spawns the hub's worker tasks. Call once;
    /// returns the bound listen address.
    pub async fn start(&self) -> Result<std::net::SocketAddr, ServiceError> {
        let Some(startup) = self.startup.lock().unwrap().take() else {
            return Err(ServiceError::AlreadyStarted);
        };

        let listener = bind_listener(self.config.port).await?;
        let local_addr = listener.local_addr()?;

        tokio::spawn(Arc::clone(&self.hub).run_event_loop(startup.connection_events_rx));
        tokio::spawn(inbound_server(Arc::clone(&self.hub), listener));
        tokio::spawn(discovery_task(
            Arc::clone(&self.hub),
            startup.discovery_rx,
        ));

        Ok(local_addr)
    }

    /// Stops everything: broadcasts close to all connections and waits for
    /// them, bounded.
    pub async fn shutdown(&self) {
        self.hub.shutdown().await;
    }

    // ## Pairing surface

    /// Installs `ski` in the pairing registry. `trust` pre-authorizes it and
    /// queues a connection attempt.
    pub fn register_remote_ski(&self, ski: &Ski, trust: bool) {
        self.hub.register_remote_ski(ski, trust);
    }

    /// Drops `ski` from the pairing registry and closes any live connection.
    pub fn unregister_remote_ski(&self, ski: &Ski) {
        self.hub.unregister_remote_ski(ski);
    }

    /// Closes the connection to `ski` without unpairing it.
    pub fn disconnect_ski(&self, ski: &Ski, reason: &str) {
        self.hub.disconnect_ski(ski, reason);
    }

    /// Accepts a pending pairing request (or pre-pairs a known SKI).
    pub fn pair_remote_service(&self, ski: &Ski) {
        self.hub.register_remote_ski(ski, true);
    }

    /// Rejects a pending pairing request.
    pub fn cancel_pairing_with_ski(&self, ski: &Ski) {
        self.hub.unregister_remote_ski(ski);
    }

    pub fn is_ski_paired(&self, ski: &Ski) -> bool {
        self.hub.is_ski_paired(ski)
    }

    pub fn is_ski_connected(&self, ski: &Ski) -> bool {
        self.hub.is_ski_connected(ski)
    }

    pub fn service_for_ski(&self, ski: &Ski) -> Option<hearth_ship_core::ServiceDetails> {
        self.hub.service_for_ski(ski)
    }

    /// The services currently visible via discovery.
    pub fn visible_remote_services(&self) -> Vec<MdnsEntry> {
        self.hub.visible_remote_services()
    }

    // ## Data plane

    /// Sends a SPINE payload to a connected peer.
    pub async fn send_spine_data(
        &self,
        ski: &Ski,
        payload: serde_json::Value,
    ) -> Result<(), ShipError> {
        self.hub.send_spine_data(ski, payload).await
    }

    // ## Use cases

    /// Registers a use case under its entity type.
    pub fn register_use_case(&self, entity_type: &str, name: &str) {
        let mut use_cases = self.use_cases.lock().unwrap();

        let registration = UseCaseRegistration {
            entity_type: entity_type.to_owned(),
            name: name.to_owned(),
        };
        if !use_cases.contains(&registration) {
            use_cases.push(registration);
        }
    }

    pub fn use_cases(&self) -> Vec<UseCaseRegistration> {
        self.use_cases.lock().unwrap().clone()
    }

    // ## Announcement data

    /// The SKI of the local service.
    pub fn local_ski(&self) -> &Ski {
        &self.local.ski
    }

    /// The TXT records an mDNS responder should announce for this service.
    pub fn mdns_txt_records(&self) -> Vec<(String, String)> {
        vec![
            ("txtvers".to_owned(), "1".to_owned()),
            ("id".to_owned(), self.local.ship_id.clone()),
            ("path".to_owned(), hearth_ship_core::constants::SHIP_PATH.to_owned()),
            ("ski".to_owned(), self.local.ski.to_string()),
            (
                "register".to_owned(),
                self.config.register_auto_accept.to_string(),
            ),
            ("brand".to_owned(), self.config.brand.clone()),
            ("model".to_owned(), self.config.model.clone()),
            ("type".to_owned(), self.config.device_type.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use hearth_ship_core::{PairingState, ServiceDetails, ShipErrorKind, SpineData};

    use super::*;

    fn test_credentials() -> ShipCredentials {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["hearth.test".to_owned()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        ShipCredentials::new(
            vec![cert.der().clone()],
            tokio_rustls::rustls::pki_types::PrivateKeyDer::try_from(
                key.serialize_der(),
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn test_config(port: u16) -> ServiceConfig {
        ServiceConfig::new("Vendor", "Demo", "HEMS", "898237", "EnergyManagementSystem", port)
            .unwrap()
    }

    type NoopHandler = tower::util::BoxService<SpineData, (), tower::BoxError>;
    type NoopMaker = fn(&ServiceDetails) -> NoopHandler;

    fn noop_handler(_details: &ServiceDetails) -> NoopHandler {
        tower::util::BoxService::new(tower::service_fn(|_data: SpineData| async move {
            Ok::<(), tower::BoxError>(())
        }))
    }

    fn test_service() -> (
        ShipService<NoopHandler, NoopMaker>,
        mpsc::UnboundedReceiver<ServiceEvent>,
    ) {
        let (_discovery_tx, discovery_rx) = mpsc::channel(4);

        let maker: NoopMaker = noop_handler;
        let (service, events) = ShipService::new(
            test_config(0),
            test_credentials(),
            discovery_rx,
            maker,
        )
        .unwrap();
        (service, events)
    }

    #[tokio::test]
    async fn pairing_registry_round_trip() {
        let (service, _events) = test_service();
        let ski = Ski::parse(&"ab".repeat(20)).unwrap();

        assert!(!service.is_ski_paired(&ski));

        service.register_remote_ski(&ski, true);
        assert!(service.is_ski_paired(&ski));
        assert!(service.service_for_ski(&ski).is_some());

        service.unregister_remote_ski(&ski);
        assert!(!service.is_ski_paired(&ski));
        assert!(service.service_for_ski(&ski).is_none());
    }

    #[tokio::test]
    async fn unregister_reports_a_cleared_detail() {
        let (service, mut events) = test_service();
        let ski = Ski::parse(&"cd".repeat(20)).unwrap();

        service.register_remote_ski(&ski, false);
        service.unregister_remote_ski(&ski);

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            ServiceEvent::ServicePairingDetailUpdate {
                detail: ConnectionStateDetail {
                    state: PairingState::None,
                    error: None,
                },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sending_to_an_unconnected_ski_fails() {
        let (service, _events) = test_service();
        let ski = Ski::parse(&"ef".repeat(20)).unwrap();

        let err = service
            .send_spine_data(&ski, json!({"x": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ShipErrorKind::Transport);
        assert!(matches!(err, ShipError::ConnectionClosed));
    }

    #[tokio::test]
    async fn use_case_registration_deduplicates() {
        let (service, _events) = test_service();

        service.register_use_case("CEM", "LPC");
        service.register_use_case("CEM", "LPC");
        service.register_use_case("GridGuard", "LPP");

        assert_eq!(service.use_cases().len(), 2);
    }

    #[tokio::test]
    async fn txt_records_describe_the_local_service() {
        let (service, _events) = test_service();
        let records = service.mdns_txt_records();

        let get = |key: &str| {
            records
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(get("path"), "/ship/");
        assert_eq!(get("id"), "Demo-HEMS-898237");
        assert_eq!(get("ski"), service.local_ski().to_string());
        assert_eq!(get("register"), "false");
    }
}
