//! # Hearth SHIP
//!
//! The brokering half of the SHIP stack. Where `hearth-ship-core` handles a
//! single peer, this crate handles all of them: the [`ConnectionsHub`] keeps
//! at most one connection per SKI, arbitrates simultaneous dials, applies
//! backoff to failed attempts and owns the pairing registry. The
//! [`ShipService`] facade is what controllers embed.
//!
//! ```text
//! discovery ──▶ hub ──▶ dial/accept ──▶ ShipConnection ──▶ events ──▶ hub ──▶ facade
//! ```

pub mod config;
mod constants;
pub mod discovery;
pub mod hub;
mod inbound;
pub mod service;

pub use config::ServiceConfig;
pub use discovery::MdnsEntry;
pub use hub::ConnectionsHub;
pub use service::{ServiceError, ServiceEvent, ShipService, UseCaseRegistration};
