use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;

/// Envelope kinds understood by the relay. Used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Join,
    Offer,
    Answer,
    IceCandidate,
    EndCall,
    CallRejected,
    Ping,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Join => "join",
            Action::Offer => "offer",
            Action::Answer => "answer",
            Action::IceCandidate => "ice-candidate",
            Action::EndCall => "end-call",
            Action::CallRejected => "call-rejected",
            Action::Ping => "ping",
        }
    }
}

/// Messages sent from a participant to the relay.
///
/// SDP and ICE payloads are carried as opaque JSON and never inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    /// Bind this connection to a participant identifier
    Join {
        #[serde(alias = "message")]
        id: String,
    },
    Offer {
        to: String,
        offer: Value,
    },
    Answer {
        to: String,
        answer: Value,
    },
    IceCandidate {
        to: String,
        candidate: Value,
    },
    EndCall {
        to: String,
    },
    CallRejected {
        to: String,
    },
    /// Heartbeat; answered with [`ServerEnvelope::Pong`]
    Ping,
}

impl ClientEnvelope {
    /// Decode a text frame. The discriminator may be named `action` or `type`.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let mut value: Value = serde_json::from_str(text)?;
        let object = value
            .as_object_mut()
            .ok_or(EnvelopeError::Invalid("envelope must be a JSON object"))?;
        if !object.contains_key("action") {
            let tag = object.remove("type").ok_or(EnvelopeError::MissingAction)?;
            object.insert("action".to_string(), tag);
        }

        let envelope: ClientEnvelope = serde_json::from_value(value)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| EnvelopeError::NonUtf8)?;
        Self::decode(text)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        match self {
            ClientEnvelope::Join { id } if id.is_empty() => {
                Err(EnvelopeError::Invalid("join identifier must not be empty"))
            }
            // An empty `to` is well-formed; it simply never resolves.
            _ => Ok(()),
        }
    }

    pub fn action(&self) -> Action {
        match self {
            ClientEnvelope::Join { .. } => Action::Join,
            ClientEnvelope::Offer { .. } => Action::Offer,
            ClientEnvelope::Answer { .. } => Action::Answer,
            ClientEnvelope::IceCandidate { .. } => Action::IceCandidate,
            ClientEnvelope::EndCall { .. } => Action::EndCall,
            ClientEnvelope::CallRejected { .. } => Action::CallRejected,
            ClientEnvelope::Ping => Action::Ping,
        }
    }

    /// Addressee of a relayable envelope; `None` for `join` and `ping`.
    pub fn destination(&self) -> Option<&str> {
        match self {
            ClientEnvelope::Offer { to, .. }
            | ClientEnvelope::Answer { to, .. }
            | ClientEnvelope::IceCandidate { to, .. }
            | ClientEnvelope::EndCall { to }
            | ClientEnvelope::CallRejected { to } => Some(to),
            ClientEnvelope::Join { .. } | ClientEnvelope::Ping => None,
        }
    }
}

/// Messages sent from the relay to a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEnvelope {
    /// Acknowledges a join; only sent to the joining connection
    Joined { id: String },
    Offer { from: String, offer: Value },
    Answer { from: String, answer: Value },
    IceCandidate { from: String, candidate: Value },
    EndCall { from: String },
    CallRejected { from: String },
    Pong,
}

impl ServerEnvelope {
    pub fn action(&self) -> Action {
        match self {
            ServerEnvelope::Joined { .. } => Action::Join,
            ServerEnvelope::Offer { .. } => Action::Offer,
            ServerEnvelope::Answer { .. } => Action::Answer,
            ServerEnvelope::IceCandidate { .. } => Action::IceCandidate,
            ServerEnvelope::EndCall { .. } => Action::EndCall,
            ServerEnvelope::CallRejected { .. } => Action::CallRejected,
            ServerEnvelope::Pong => Action::Ping,
        }
    }
}
