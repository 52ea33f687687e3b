use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RELAY_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// One frame on the relay websocket. Session-description and candidate blobs
/// are carried as opaque JSON and never inspected here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    Register {
        name: String,
    },
    RegisterAck {
        success: bool,
    },
    Offer {
        from: String,
        to: String,
        offer: Value,
    },
    Answer {
        from: String,
        to: String,
        answer: Value,
    },
    Candidate {
        from: String,
        to: String,
        candidate: Value,
    },
    Error {
        code: String,
        message: String,
    },
}

impl RelayMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Register { .. } => "register",
            RelayMessage::RegisterAck { .. } => "registerAck",
            RelayMessage::Offer { .. } => "offer",
            RelayMessage::Answer { .. } => "answer",
            RelayMessage::Candidate { .. } => "candidate",
            RelayMessage::Error { .. } => "error",
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(RelayMessage),
    /// Well-formed JSON object whose `type` is not part of the schema.
    Unknown { typ: String },
}

const KNOWN_TYPES: [&str; 6] = [
    "register",
    "registerAck",
    "offer",
    "answer",
    "candidate",
    "error",
];

pub fn decode_text(raw: &str) -> Result<Decoded> {
    if raw.len() > RELAY_MAX_MESSAGE_BYTES {
        anyhow::bail!("relay frame too large: {} bytes", raw.len());
    }
    let value: Value = serde_json::from_str(raw)?;
    let typ = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => anyhow::bail!("relay frame has no type"),
    };
    if !KNOWN_TYPES.contains(&typ.as_str()) {
        return Ok(Decoded::Unknown { typ });
    }
    let msg: RelayMessage = serde_json::from_value(value)?;
    Ok(Decoded::Message(msg))
}

pub fn decode_binary(raw: &[u8]) -> Result<Decoded> {
    // Some relays frame JSON as binary; treat it as UTF-8 text.
    let txt = std::str::from_utf8(raw)?;
    decode_text(txt)
}
