use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use metrics::counter;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch;
use crate::envelope::{ClientEnvelope, ServerEnvelope};
use crate::error::EnvelopeError;
use crate::registry::{Outbound, ParticipantChannel, Registry};

/// How long a closing session waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, no identifier bound yet
    Connecting,
    /// Bound to the contained identifier
    Active(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream from the participant
    ClientClosed,
    Transport,
    Decode,
    WriteFailed,
    IdleTimeout,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Transport => "transport_error",
            CloseReason::Decode => "decode_error",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::IdleTimeout => "idle_timeout",
        }
    }
}

enum Inbound {
    Frame(Message),
    Ended,
    Failed(tungstenite::Error),
    Idle,
}

/// Owns one accepted WebSocket connection from handshake to close.
pub struct SessionHandler<S> {
    connection_id: Uuid,
    remote_addr: Option<SocketAddr>,
    registry: Registry,
    idle_timeout: Option<Duration>,
    socket: WebSocketStream<S>,
}

impl<S> SessionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        socket: WebSocketStream<S>,
        registry: Registry,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            remote_addr,
            registry,
            idle_timeout: None,
            socket,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Run the receive loop until the connection closes. The session's own
    /// binding is removed before this returns.
    pub async fn run(self) -> CloseReason {
        let Self {
            connection_id,
            remote_addr,
            registry,
            idle_timeout,
            socket,
        } = self;

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let mut writer = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let message = match outbound {
                    Outbound::Envelope(envelope) => match serde_json::to_string(&envelope) {
                        Ok(json) => Message::Text(json.into()),
                        Err(err) => {
                            warn!(%connection_id, error = %err, "failed to encode envelope");
                            continue;
                        }
                    },
                    Outbound::Close(frame) => {
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        return Ok(());
                    }
                };
                sink.send(message).await?;
            }
            let _ = sink.close().await;
            Ok::<_, tungstenite::Error>(())
        });

        let mut session = Session {
            connection_id,
            registry,
            channel: ParticipantChannel::new(connection_id, remote_addr, tx),
            state: SessionState::Connecting,
        };

        debug!(%connection_id, ?remote_addr, "session started");

        let mut writer_done = false;
        let reason = loop {
            let inbound = tokio::select! {
                inbound = next_inbound(&mut stream, idle_timeout) => inbound,
                result = &mut writer => {
                    writer_done = true;
                    if let Ok(Err(err)) = result {
                        debug!(%connection_id, error = %err, "websocket write failed");
                    }
                    break CloseReason::WriteFailed;
                }
            };

            match inbound {
                Inbound::Frame(Message::Text(text)) => {
                    if let Err(err) = session.handle_frame(ClientEnvelope::decode(text.as_str())) {
                        session.reject(&err);
                        break CloseReason::Decode;
                    }
                }
                Inbound::Frame(Message::Binary(data)) => {
                    if let Err(err) = session.handle_frame(ClientEnvelope::decode_binary(&data)) {
                        session.reject(&err);
                        break CloseReason::Decode;
                    }
                }
                Inbound::Frame(Message::Close(_)) | Inbound::Ended => {
                    break CloseReason::ClientClosed;
                }
                // tungstenite answers pings itself
                Inbound::Frame(_) => {}
                Inbound::Failed(err) => {
                    debug!(%connection_id, error = %err, "websocket receive failed");
                    break CloseReason::Transport;
                }
                Inbound::Idle => {
                    info!(%connection_id, "closing idle session");
                    session.channel.close(CloseFrame {
                        code: CloseCode::Away,
                        reason: Utf8Bytes::from_static("idle timeout"),
                    });
                    break CloseReason::IdleTimeout;
                }
            }
        };

        session.close(reason);
        drop(session);

        if !writer_done {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }

        reason
    }
}

async fn next_inbound<St>(stream: &mut St, idle_timeout: Option<Duration>) -> Inbound
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => stream.next().await,
    };

    match next {
        Some(Ok(message)) => Inbound::Frame(message),
        Some(Err(err)) => Inbound::Failed(err),
        None => Inbound::Ended,
    }
}

struct Session {
    connection_id: Uuid,
    registry: Registry,
    channel: ParticipantChannel,
    state: SessionState,
}

impl Session {
    fn handle_frame(
        &mut self,
        decoded: Result<ClientEnvelope, EnvelopeError>,
    ) -> Result<(), EnvelopeError> {
        let envelope = decoded?;
        debug!(
            connection_id = %self.connection_id,
            action = envelope.action().as_str(),
            "received envelope"
        );

        match envelope {
            ClientEnvelope::Join { id } => self.join(id),
            ClientEnvelope::Ping => {
                let _ = self.channel.send(ServerEnvelope::Pong);
            }
            relayable => match self.bound_sender() {
                Some(sender) => {
                    dispatch::relay(&self.registry, &sender, relayable);
                }
                None => {
                    warn!(
                        connection_id = %self.connection_id,
                        action = relayable.action().as_str(),
                        "dropping envelope from unbound session"
                    );
                    counter!(
                        "signal_relay_envelopes_dropped_total",
                        1,
                        "reason" => "unbound_sender"
                    );
                }
            },
        }
        Ok(())
    }

    /// Identifier this connection currently speaks for. A session whose
    /// identifier was taken over by a later join drops back to `Connecting`.
    fn bound_sender(&mut self) -> Option<String> {
        let SessionState::Active(id) = &self.state else {
            return None;
        };
        match self.registry.lookup(id) {
            Some(current) if current.same_connection(&self.channel) => Some(id.clone()),
            _ => {
                info!(
                    participant = %id,
                    connection_id = %self.connection_id,
                    "identifier no longer bound to this session"
                );
                self.state = SessionState::Connecting;
                None
            }
        }
    }

    fn join(&mut self, id: String) {
        if let SessionState::Active(current) = &self.state {
            if *current != id && self.registry.unbind(current, &self.channel) {
                info!(
                    connection_id = %self.connection_id,
                    from = %current,
                    to = %id,
                    "participant rebound to new identifier"
                );
            }
        }

        if let Some(previous) = self.registry.bind(&id, self.channel.clone()) {
            if !previous.same_connection(&self.channel) {
                info!(
                    participant = %id,
                    evicted = %previous.connection_id(),
                    "identifier taken over by new connection"
                );
            }
        }

        info!(participant = %id, connection_id = %self.connection_id, "participant joined");
        let _ = self.channel.send(ServerEnvelope::Joined { id: id.clone() });
        self.state = SessionState::Active(id);
    }

    fn reject(&self, err: &EnvelopeError) {
        warn!(connection_id = %self.connection_id, error = %err, "closing session on malformed envelope");
        counter!("signal_relay_decode_errors_total", 1);
        self.channel.close(CloseFrame {
            code: CloseCode::Invalid,
            reason: Utf8Bytes::from_static("invalid envelope"),
        });
    }

    fn close(&mut self, reason: CloseReason) {
        if let SessionState::Active(id) = &self.state {
            if self.registry.unbind(id, &self.channel) {
                info!(participant = %id, connection_id = %self.connection_id, "participant left");
            }
        }
        self.state = SessionState::Closed;

        counter!(
            "signal_relay_sessions_closed_total",
            1,
            "reason" => reason.as_str()
        );
        debug!(connection_id = %self.connection_id, reason = reason.as_str(), "session closed");
    }
}
