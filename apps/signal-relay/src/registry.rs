use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::gauge;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use uuid::Uuid;

use crate::envelope::ServerEnvelope;
use crate::error::{RelayError, RelayResult};

/// Frames queued for a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Envelope(ServerEnvelope),
    Close(CloseFrame),
}

/// Handle to one connection's outbound queue.
///
/// Two handles are the same channel when they were created for the same
/// connection; this is what guards [`Registry::unbind`].
#[derive(Debug, Clone)]
pub struct ParticipantChannel {
    connection_id: Uuid,
    remote_addr: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ParticipantChannel {
    pub(crate) fn new(
        connection_id: Uuid,
        remote_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            connection_id,
            remote_addr,
            tx,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn same_connection(&self, other: &ParticipantChannel) -> bool {
        self.connection_id == other.connection_id
    }

    /// Enqueue an envelope. Fails once the connection's writer has gone away.
    pub fn send(&self, envelope: ServerEnvelope) -> RelayResult<()> {
        self.tx
            .send(Outbound::Envelope(envelope))
            .map_err(|_| RelayError::ChannelClosed)
    }

    pub(crate) fn close(&self, frame: CloseFrame) {
        let _ = self.tx.send(Outbound::Close(frame));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
struct Binding {
    channel: ParticipantChannel,
    joined_at: DateTime<Utc>,
}

/// Diagnostic view of one binding
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: String,
    pub connection_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<SocketAddr>,
    pub joined_at: DateTime<Utc>,
}

/// Process-wide map of participant identifier -> live channel.
///
/// Cloning is cheap and every clone observes the same bindings. Each call is
/// atomic for its key; no operation spans more than one key.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    bindings: Arc<DashMap<String, Binding>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `channel`, replacing any previous binding (last write wins).
    /// Returns the evicted channel, if there was one.
    pub fn bind(&self, id: &str, channel: ParticipantChannel) -> Option<ParticipantChannel> {
        let previous = self.bindings.insert(
            id.to_string(),
            Binding {
                channel,
                joined_at: Utc::now(),
            },
        );
        self.record_size();
        previous.map(|binding| binding.channel)
    }

    /// Remove the binding for `id` only if it still points at `channel`.
    pub fn unbind(&self, id: &str, channel: &ParticipantChannel) -> bool {
        let removed = self
            .bindings
            .remove_if(id, |_, binding| binding.channel.same_connection(channel))
            .is_some();
        if removed {
            self.record_size();
        }
        removed
    }

    pub fn lookup(&self, id: &str) -> Option<ParticipantChannel> {
        self.bindings.get(id).map(|entry| entry.channel.clone())
    }

    pub fn snapshot_ids(&self) -> BTreeSet<String> {
        self.bindings.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Bindings sorted by identifier
    pub fn snapshot(&self) -> Vec<ParticipantInfo> {
        let mut participants: Vec<ParticipantInfo> = self
            .bindings
            .iter()
            .map(|entry| ParticipantInfo {
                id: entry.key().clone(),
                connection_id: entry.channel.connection_id,
                remote_addr: entry.channel.remote_addr,
                joined_at: entry.joined_at,
            })
            .collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn record_size(&self) {
        gauge!("signal_relay_participants_bound", self.bindings.len() as f64);
    }
}
