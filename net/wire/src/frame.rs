//! SHIP framing.
//!
//! A frame is one type byte followed by the message body. INIT bodies are a
//! single `0x00` byte, all other bodies are UTF-8 JSON in the EEBUS canonical
//! form (see [`json`](crate::json)).

use serde_json::Value;

use crate::{
    json::{from_eebus_json, into_eebus_json},
    message::{ConnectionClose, ConnectionCloseEnvelope, ControlMessage, ShipData},
    WireError,
};

/// The SPINE payload is spliced into the encoded data frame after the
/// envelope and the payload have been transformed independently, otherwise
/// the envelope transform would wrap the already canonical payload again.
const PAYLOAD_PLACEHOLDER: &str = r#"{"place":"holder"}"#;
const WRAPPED_PLACEHOLDER: &str = r#"[{"place":"holder"}]"#;

/// The frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Connection mode initialisation, exchanged before anything else.
    Init,
    /// Handshake messages.
    Control,
    /// SPINE payload tunnel.
    Data,
    /// Orderly connection termination.
    End,
}

impl MessageKind {
    pub const fn byte(self) -> u8 {
        match self {
            Self::Init => 0x00,
            Self::Control => 0x01,
            Self::Data => 0x02,
            Self::End => 0x06,
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Init),
            0x01 => Some(Self::Control),
            0x02 => Some(Self::Data),
            0x06 => Some(Self::End),
            _ => None,
        }
    }
}

/// A complete SHIP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShipMessage {
    Init,
    Control(ControlMessage),
    Data(ShipData),
    End(ConnectionClose),
}

impl ShipMessage {
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Init => MessageKind::Init,
            Self::Control(_) => MessageKind::Control,
            Self::Data(_) => MessageKind::Data,
            Self::End(_) => MessageKind::End,
        }
    }

    /// A short name for log lines.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Control(control) => control.name(),
            Self::Data(_) => "data",
            Self::End(_) => "connectionClose",
        }
    }

    /// Encodes the frame into its binary wire form.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Init => Ok(vec![MessageKind::Init.byte(), 0x00]),
            Self::Control(control) => {
                encode_json_frame(MessageKind::Control, &serde_json::to_value(control)?)
            }
            Self::Data(data) => encode_data_frame(data),
            Self::End(close) => {
                let envelope = ConnectionCloseEnvelope {
                    connection_close: close.clone(),
                };
                encode_json_frame(MessageKind::End, &serde_json::to_value(&envelope)?)
            }
        }
    }

    /// Decodes a binary frame.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < 2 {
            return Err(WireError::FrameTooShort(frame.len()));
        }

        let kind = MessageKind::from_byte(frame[0])
            .ok_or(WireError::UnknownMessageKind(frame[0]))?;
        let body = &frame[1..];

        match kind {
            MessageKind::Init => {
                if body == [0x00] {
                    Ok(Self::Init)
                } else {
                    Err(WireError::InvalidInitBody)
                }
            }
            MessageKind::Control => {
                let value = decode_json_body(body)?;
                serde_json::from_value(value)
                    .map(Self::Control)
                    .map_err(|_| WireError::SchemaMismatch("control message"))
            }
            MessageKind::Data => {
                let value = decode_json_body(body)?;
                serde_json::from_value(value)
                    .map(Self::Data)
                    .map_err(|_| WireError::SchemaMismatch("data message"))
            }
            MessageKind::End => {
                // A bare `0x00` END body is the minimal close announcement.
                if body == [0x00] {
                    return Ok(Self::End(ConnectionClose::default()));
                }

                let value = decode_json_body(body)?;
                serde_json::from_value::<ConnectionCloseEnvelope>(value)
                    .map(|envelope| Self::End(envelope.connection_close))
                    .map_err(|_| WireError::SchemaMismatch("connectionClose message"))
            }
        }
    }
}

fn encode_json_frame(kind: MessageKind, value: &Value) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_string(&into_eebus_json(value))?;

    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(kind.byte());
    frame.extend_from_slice(body.as_bytes());
    Ok(frame)
}

fn encode_data_frame(data: &ShipData) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_string(&into_eebus_json(&data.data.payload))?;

    let mut envelope = serde_json::to_value(data)?;
    envelope["data"]["payload"] = serde_json::from_str(PAYLOAD_PLACEHOLDER)?;

    let body = serde_json::to_string(&into_eebus_json(&envelope))?;
    let body = body.replacen(WRAPPED_PLACEHOLDER, &payload, 1);

    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(MessageKind::Data.byte());
    frame.extend_from_slice(body.as_bytes());
    Ok(frame)
}

fn decode_json_body(body: &[u8]) -> Result<Value, WireError> {
    let value: Value = serde_json::from_slice(body)?;
    Ok(from_eebus_json(&value))
}
