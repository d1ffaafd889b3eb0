//! # Hearth Wire
//!
//! A crate defining the SHIP wire format: the one-byte frame type tag, the
//! EEBUS-JSON canonical form and the serde models for every SHIP message
//! exchanged during connection setup and the data phase.
//!
//! This crate is transport agnostic, it only deals with complete binary
//! frames. Reading and writing them over a websocket is the job of
//! `hearth-ship-core`.

pub mod frame;
pub mod json;
pub mod message;

pub use frame::{MessageKind, ShipMessage};
pub use message::*;

use thiserror::Error;

/// Possible errors when encoding or decoding SHIP frames.
///
/// Both directions are total: malformed input always maps to an error
/// variant, never to a truncated or partially decoded frame.
#[derive(Error, Debug)]
pub enum WireError {
    /// The frame is shorter than the minimum of a type byte plus one body byte.
    #[error("Frame is too short: {0} bytes")]
    FrameTooShort(usize),
    /// The frame type byte is not a known SHIP message type.
    #[error("Unknown SHIP message type: {0:#04x}")]
    UnknownMessageKind(u8),
    /// An INIT frame must carry a single `0x00` byte as its body.
    #[error("Invalid INIT message body")]
    InvalidInitBody,
    /// The body is not valid UTF-8 JSON.
    #[error("Failed to parse frame body: {0}")]
    MalformedBody(#[from] serde_json::Error),
    /// The body parsed as JSON but does not match the schema for its frame type.
    #[error("Body does not match the schema for its frame type: {0}")]
    SchemaMismatch(&'static str),
}
