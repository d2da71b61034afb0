//! Text frame codec.
//!
//! Wire grammar (ASCII, newline terminated):
//!
//! ```text
//! frame  := "ID:" id "," ("SECRET_KEY:" key ",")? role ",CRC:" hex8 "\n"
//! role   := "CMD:" verb | "DATA:" payload
//! ```
//!
//! Decoding verifies the checksum first, then tokenizes the body field by
//! field. The role field is always last and owns the remainder of the body, so
//! verbs such as `BRD:DISC` and data payloads such as `temp:21.5,hum:40` may
//! contain `:` and `,` freely.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use super::checksum::{self, CRC_DELIMITER};

/// Shared key used when neither the caller nor the registry supplies one.
pub const DEFAULT_SECRET_KEY: &str = "123";

/// Broadcast discovery verb; also the reply devices send when announcing themselves.
pub const VERB_DISCOVERY: &str = "BRD:DISC";
/// Status report prefix, e.g. `led_status:1`.
pub const VERB_STATUS_PREFIX: &str = "led_status:";
pub const VERB_RESET_DATA: &str = "reset_data";
pub const VERB_GET_DATA: &str = "get_data";
/// Secret key rotation prefix, e.g. `set_secret_key:9f2c`.
pub const VERB_SET_SECRET_KEY_PREFIX: &str = "set_secret_key:";
/// Liveness check.
pub const VERB_CHECK: &str = "CHECK";

const FIELD_ID: &str = "ID";
const FIELD_SECRET_KEY: &str = "SECRET_KEY";
// Older coordinator firmware spells the key field this way.
const FIELD_SECRET_KEY_LEGACY: &str = "SECRECT_KEY";
const FIELD_CMD: &str = "CMD";
const FIELD_DATA: &str = "DATA";

/// Reasons an inbound line is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Checksum missing or mismatched.
    #[error("integrity check failed")]
    Integrity,

    /// Checksum fine but the body does not follow the grammar.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Addressee of an outbound command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Target {
    Device(String),
    Broadcast,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(id) => f.write_str(id),
            Target::Broadcast => f.write_str("*"),
        }
    }
}

/// An outbound instruction waiting in (or travelling through) the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    pub target: Target,
    pub secret_key: Option<String>,
    pub verb: String,
}

impl Command {
    pub fn new(id: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            target: Target::Device(id.into()),
            secret_key: None,
            verb: verb.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    /// The unaddressed discovery request.
    pub fn broadcast_discovery() -> Self {
        Self {
            target: Target::Broadcast,
            secret_key: None,
            verb: VERB_DISCOVERY.to_string(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.target, Target::Broadcast)
    }

    pub fn target_id(&self) -> Option<&str> {
        match &self.target {
            Target::Device(id) => Some(id),
            Target::Broadcast => None,
        }
    }

    /// Verbs whose reply arrives as a `DATA:` frame rather than an echo.
    pub fn yields_data(&self) -> bool {
        self.verb == VERB_GET_DATA || self.verb == VERB_RESET_DATA
    }

    /// Body of the frame, without checksum or terminator.
    pub fn body(&self, default_key: &str) -> String {
        match &self.target {
            Target::Device(id) => format!(
                "{}:{},{}:{},{}:{}",
                FIELD_ID,
                id,
                FIELD_SECRET_KEY,
                self.secret_key.as_deref().unwrap_or(default_key),
                FIELD_CMD,
                self.verb
            ),
            Target::Broadcast => format!("{}:{}", FIELD_CMD, self.verb),
        }
    }

    /// Full wire line including `,CRC:<hex8>` and the terminator.
    pub fn encode(&self, default_key: &str) -> String {
        seal(&self.body(default_key))
    }
}

/// Append the checksum field and line terminator to a frame body.
pub fn seal(body: &str) -> String {
    format!(
        "{}{}{}\n",
        body,
        CRC_DELIMITER,
        checksum::to_hex(checksum::compute(body.as_bytes()))
    )
}

/// Role field of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Role {
    #[serde(rename = "cmd")]
    Command(String),
    #[serde(rename = "data")]
    Data(String),
}

/// A verified, parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub role: Role,
}

impl Frame {
    pub fn verb(&self) -> Option<&str> {
        match &self.role {
            Role::Command(v) => Some(v),
            Role::Data(_) => None,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self.role, Role::Data(_))
    }

    /// Re-encode as a wire line (used by device simulators and tests).
    pub fn to_line(&self) -> String {
        let mut body = format!("{}:{},", FIELD_ID, self.id);
        if let Some(key) = &self.secret_key {
            body.push_str(&format!("{}:{},", FIELD_SECRET_KEY, key));
        }
        match &self.role {
            Role::Command(v) => body.push_str(&format!("{}:{}", FIELD_CMD, v)),
            Role::Data(p) => body.push_str(&format!("{}:{}", FIELD_DATA, p)),
        }
        seal(&body)
    }
}

/// Verify and parse one line read from the transport.
pub fn decode(line: &str) -> Result<Frame, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if !checksum::verify(line) {
        return Err(FrameError::Integrity);
    }
    let (body, _) = checksum::split(line).ok_or(FrameError::Integrity)?;

    let mut id: Option<String> = None;
    let mut secret_key: Option<String> = None;
    let mut rest = body;

    loop {
        let (key, after) = rest
            .split_once(':')
            .ok_or_else(|| FrameError::Malformed(format!("field without ':' in '{}'", rest)))?;
        match key {
            FIELD_CMD | FIELD_DATA => {
                let id = id.ok_or_else(|| FrameError::Malformed("missing ID field".into()))?;
                let role = if key == FIELD_CMD {
                    Role::Command(after.to_string())
                } else {
                    Role::Data(after.to_string())
                };
                return Ok(Frame { id, secret_key, role });
            }
            FIELD_ID | FIELD_SECRET_KEY | FIELD_SECRET_KEY_LEGACY => {
                let (value, next) = after
                    .split_once(',')
                    .ok_or_else(|| FrameError::Malformed("missing CMD or DATA field".into()))?;
                let slot = if key == FIELD_ID { &mut id } else { &mut secret_key };
                if slot.is_some() {
                    return Err(FrameError::Malformed(format!("duplicate {} field", key)));
                }
                if key == FIELD_ID && value.is_empty() {
                    return Err(FrameError::Malformed("empty ID".into()));
                }
                *slot = Some(value.to_string());
                rest = next;
            }
            other => {
                return Err(FrameError::Malformed(format!("unexpected field '{}'", other)));
            }
        }
    }
}

/// What an inbound frame means to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Discovery,
    Status(String),
    Data(String),
    ResetData,
    DataRequest,
    SecretKey(String),
    Check,
    /// Any verb the gateway does not interpret; forwarded upstream as-is.
    Passthrough(String),
}

pub fn classify(frame: &Frame) -> InboundKind {
    let verb = match &frame.role {
        Role::Data(payload) => return InboundKind::Data(payload.clone()),
        Role::Command(verb) => verb.as_str(),
    };
    if verb == VERB_DISCOVERY {
        InboundKind::Discovery
    } else if let Some(token) = verb.strip_prefix(VERB_STATUS_PREFIX) {
        InboundKind::Status(token.to_string())
    } else if verb == VERB_RESET_DATA {
        InboundKind::ResetData
    } else if verb == VERB_GET_DATA {
        InboundKind::DataRequest
    } else if let Some(key) = verb.strip_prefix(VERB_SET_SECRET_KEY_PREFIX) {
        InboundKind::SecretKey(key.to_string())
    } else if verb == VERB_CHECK {
        InboundKind::Check
    } else {
        InboundKind::Passthrough(verb.to_string())
    }
}
