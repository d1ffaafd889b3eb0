//! SHIP message models.
//!
//! Every CONTROL, DATA and END body is a single-key JSON object whose key
//! names the message. [`ControlMessage`] models that root as an externally
//! tagged enum, so serde produces and consumes exactly the wire shape.
//!
//! Field names follow the SHIP schema (camelCase on the wire).

use serde::{ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};

/// The protocol id carried in every data-phase header.
pub const SHIP_PROTOCOL_ID: &str = "ee1.0";

/// The only message format this implementation speaks.
pub const FORMAT_JSON_UTF8: &str = "JSON-UTF8";

/// The protocol version proposed and selected during the handshake.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// The CONTROL message root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    #[serde(rename = "connectionHello")]
    Hello(ConnectionHello),
    #[serde(rename = "messageProtocolHandshake")]
    ProtocolHandshake(MessageProtocolHandshake),
    #[serde(rename = "messageProtocolHandshakeError")]
    ProtocolHandshakeError(MessageProtocolHandshakeError),
    #[serde(rename = "connectionPinState")]
    PinState(ConnectionPinState),
    #[serde(rename = "accessMethodsRequest")]
    AccessMethodsRequest(AccessMethodsRequest),
    #[serde(rename = "accessMethods")]
    AccessMethods(AccessMethods),
}

impl ControlMessage {
    /// A short name for log lines.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "connectionHello",
            Self::ProtocolHandshake(_) => "messageProtocolHandshake",
            Self::ProtocolHandshakeError(_) => "messageProtocolHandshakeError",
            Self::PinState(_) => "connectionPinState",
            Self::AccessMethodsRequest(_) => "accessMethodsRequest",
            Self::AccessMethods(_) => "accessMethods",
        }
    }
}

/// The trust negotiation message, exchanged until both sides are `ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHello {
    pub phase: ConnectionHelloPhase,
    /// How long the sender will keep waiting for trust, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting: Option<u64>,
    /// Set when the sender asks the peer to extend its waiting window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prolongation_request: Option<bool>,
}

impl ConnectionHello {
    pub const fn ready() -> Self {
        Self {
            phase: ConnectionHelloPhase::Ready,
            waiting: None,
            prolongation_request: None,
        }
    }

    pub const fn pending(waiting_millis: u64) -> Self {
        Self {
            phase: ConnectionHelloPhase::Pending,
            waiting: Some(waiting_millis),
            prolongation_request: None,
        }
    }

    pub const fn aborted() -> Self {
        Self {
            phase: ConnectionHelloPhase::Aborted,
            waiting: None,
            prolongation_request: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionHelloPhase {
    Pending,
    Ready,
    Aborted,
}

/// Protocol and format negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProtocolHandshake {
    pub handshake_type: ProtocolHandshakeType,
    pub version: Version,
    pub formats: MessageProtocolFormats,
}

impl MessageProtocolHandshake {
    /// The client side proposal: maximum version, JSON-UTF8 only.
    pub fn announce_max() -> Self {
        Self {
            handshake_type: ProtocolHandshakeType::AnnounceMax,
            version: PROTOCOL_VERSION,
            formats: MessageProtocolFormats::json_utf8(),
        }
    }

    /// The server side selection mirroring our only supported combination.
    pub fn select() -> Self {
        Self {
            handshake_type: ProtocolHandshakeType::Select,
            version: PROTOCOL_VERSION,
            formats: MessageProtocolFormats::json_utf8(),
        }
    }

    /// Whether version and format match the single combination we support.
    pub fn is_supported(&self) -> bool {
        self.version == PROTOCOL_VERSION
            && self
                .formats
                .format
                .iter()
                .any(|format| format == FORMAT_JSON_UTF8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolHandshakeType {
    AnnounceMax,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProtocolFormats {
    pub format: Vec<String>,
}

impl MessageProtocolFormats {
    pub fn json_utf8() -> Self {
        Self {
            format: vec![FORMAT_JSON_UTF8.to_owned()],
        }
    }
}

/// Handshake acknowledgement and abort message.
///
/// `error == 0` acknowledges the selection, anything else reports the reason
/// for tearing the handshake down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProtocolHandshakeError {
    pub error: u8,
}

impl MessageProtocolHandshakeError {
    pub const NO_ERROR: Self = Self { error: 0 };
    pub const UNEXPECTED_MESSAGE: Self = Self { error: 2 };
    pub const SELECTION_MISMATCH: Self = Self { error: 3 };
}

/// PIN verification state. Only `none` is supported on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPinState {
    pub pin_state: PinState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_permission: Option<PinInputPermission>,
}

impl ConnectionPinState {
    pub const fn none() -> Self {
        Self {
            pin_state: PinState::None,
            input_permission: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinState {
    Required,
    Optional,
    PinOk,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinInputPermission {
    Busy,
    Ok,
}

/// Request for the peer's access methods.
///
/// The body carries no members, a peer may send `{}` or the canonical empty
/// wrapper `[]`, so deserialization accepts any shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessMethodsRequest;

impl Serialize for AccessMethodsRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

impl<'de> Deserialize<'de> for AccessMethodsRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde::de::IgnoredAny::deserialize(deserializer)?;
        Ok(Self)
    }
}

/// The peer's access methods, carrying its ShipID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethods {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// The DATA message root, tunnelling one SPINE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipData {
    pub data: DataType,
}

impl ShipData {
    /// Wraps a SPINE payload into a data frame with the standard header.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            data: DataType {
                header: HeaderType {
                    protocol_id: SHIP_PROTOCOL_ID.to_owned(),
                },
                payload,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataType {
    pub header: HeaderType,
    /// The SPINE payload in standard JSON form. The frame layer transforms it
    /// to and from the canonical form independently of the envelope.
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderType {
    pub protocol_id: String,
}

/// The END message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionClose {
    pub phase: ConnectionClosePhase,
    /// Milliseconds the sender will wait for the confirming close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConnectionCloseReason>,
}

impl ConnectionClose {
    pub const fn announce() -> Self {
        Self {
            phase: ConnectionClosePhase::Announce,
            max_time: None,
            reason: None,
        }
    }

    pub const fn confirm() -> Self {
        Self {
            phase: ConnectionClosePhase::Confirm,
            max_time: None,
            reason: None,
        }
    }
}

impl Default for ConnectionClose {
    fn default() -> Self {
        Self::announce()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionClosePhase {
    Announce,
    Confirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionCloseReason {
    Unspecific,
    RemovedConnection,
}

/// Wrapper giving the END body its single-key root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectionCloseEnvelope {
    pub connection_close: ConnectionClose,
}
