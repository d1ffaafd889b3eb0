//! `hearthd` - a reference EEBUS SHIP peer.
//!
//! Announces a local service, accepts and dials SHIP connections and logs
//! every event. Pairing decisions and SPINE traffic are only logged, a real
//! controller would attach to the service facade instead.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use hearth_ship::{MdnsEntry, ServiceConfig, ServiceEvent, ShipService};
use hearth_ship_core::{transport::ShipCredentials, ServiceDetails, ShipError, SpineData};

#[derive(Debug, Parser)]
#[command(name = "hearthd", about)]
struct Args {
    /// EEBUS vendor code.
    #[arg(long, default_value = "Demo")]
    vendor: String,
    /// Device brand name.
    #[arg(long, default_value = "Demo")]
    brand: String,
    /// Device model name.
    #[arg(long, default_value = "HEMS")]
    model: String,
    /// Device serial number.
    #[arg(long, default_value = "898237")]
    serial: String,
    /// PEM file with the service certificate.
    #[arg(long)]
    cert: PathBuf,
    /// PEM file with the matching private key.
    #[arg(long)]
    key: PathBuf,
    /// Port the SHIP endpoint listens on.
    #[arg(long, default_value_t = 4_712)]
    port: u16,
    /// Trust incoming pairing requests without confirmation.
    #[arg(long)]
    auto_accept: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<(), Error> {
    let credentials = load_credentials(&args.cert, &args.key)?;

    let mut config = ServiceConfig::new(
        &args.vendor,
        &args.brand,
        &args.model,
        &args.serial,
        "EnergyManagementSystem",
        args.port,
    )?;
    config.register_auto_accept = args.auto_accept;

    // A real deployment wires an mDNS browser into this channel; the
    // reference binary only dials peers it is told about.
    let (_discovery_tx, discovery_rx) = mpsc::channel::<Vec<MdnsEntry>>(4);

    let (service, mut events) = ShipService::new(
        config,
        credentials,
        discovery_rx,
        spine_logger,
    )?;

    let addr = service.start().await?;
    tracing::info!(ski = %service.local_ski(), %addr, "SHIP service started");

    loop {
        tokio::select! {
            () = shutdown_signal() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
            }
        }
    }

    tracing::info!("Shutting down");
    service.shutdown().await;
    Ok(())
}

fn log_event(event: &ServiceEvent) {
    match event {
        ServiceEvent::RemoteSkiConnected(ski) => tracing::info!(%ski, "Peer connected"),
        ServiceEvent::RemoteSkiDisconnected(ski) => tracing::info!(%ski, "Peer disconnected"),
        ServiceEvent::ServicePairingDetailUpdate { ski, detail } => {
            tracing::info!(%ski, ?detail, "Pairing detail update");
        }
        ServiceEvent::ServiceShipIdUpdate { ski, ship_id } => {
            tracing::info!(%ski, ship_id, "ShipID update");
        }
        ServiceEvent::VisibleRemoteServicesUpdated(entries) => {
            tracing::info!(count = entries.len(), "Visible services update");
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

type SpineLogger = tower::util::BoxService<SpineData, (), tower::BoxError>;

fn spine_logger(details: &ServiceDetails) -> SpineLogger {
    let ski = details.ski.clone();

    tower::util::BoxService::new(tower::service_fn(move |data: SpineData| {
        let ski = ski.clone();
        async move {
            tracing::info!(%ski, payload = %data.payload, "SPINE payload");
            Ok::<(), tower::BoxError>(())
        }
    }))
}

fn load_credentials(cert: &Path, key: &Path) -> Result<ShipCredentials, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or(Error::MissingKey)?;

    Ok(ShipCredentials::new(certs, key)?)
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] hearth_ship::config::InvalidServiceConfig),
    #[error("service error: {0}")]
    Service(#[from] hearth_ship::ServiceError),
    #[error("ship error: {0}")]
    Ship(#[from] ShipError),
    #[error("the key file contains no private key")]
    MissingKey,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
