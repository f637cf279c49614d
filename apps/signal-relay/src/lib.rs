//! Signaling relay for peer-to-peer call setup.
//!
//! Participants connect over WebSocket, `join` under an identifier, and
//! exchange offers, answers, ICE candidates and call-control events through
//! the relay. Media never passes through it.

pub mod admin;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod registry;
pub mod session;
pub mod telemetry;

pub use config::RelayConfig;
pub use envelope::{ClientEnvelope, ServerEnvelope};
pub use error::{EnvelopeError, RelayError, RelayResult};
pub use listener::RelayServer;
pub use registry::{ParticipantChannel, ParticipantInfo, Registry};
