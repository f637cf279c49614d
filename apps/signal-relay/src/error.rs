use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Reasons an inbound frame could not be turned into a [`ClientEnvelope`].
///
/// [`ClientEnvelope`]: crate::envelope::ClientEnvelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    NonUtf8,
    #[error("envelope is missing an `action` or `type` field")]
    MissingAction,
    #[error("invalid envelope: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] EnvelopeError),
    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("websocket handshake timed out")]
    HandshakeTimeout,
    #[error("participant channel closed")]
    ChannelClosed,
}

pub type RelayResult<T> = Result<T, RelayError>;
