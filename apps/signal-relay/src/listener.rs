use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::registry::Registry;
use crate::session::SessionHandler;

/// Accepts relay connections and runs one [`SessionHandler`] task per
/// connection. There is no limit on concurrent connections.
pub struct RelayServer {
    listener: TcpListener,
    registry: Registry,
    config: RelayConfig,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;
        Ok(Self {
            listener,
            registry: Registry::new(),
            config,
        })
    }

    /// Share an existing registry instead of the one created by [`bind`].
    ///
    /// [`bind`]: RelayServer::bind
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` resolves. Sessions already running
    /// are not interrupted.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "signal relay listening");
        }

        let listener = &self.listener;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("relay listener stopping");
                    break;
                }
                accepted = accept_with_retry(
                    move || listener.accept(),
                    self.config.accept_retries,
                    self.config.accept_backoff,
                ) => {
                    if let Some((stream, remote_addr)) = accepted {
                        self.spawn_session(stream, remote_addr);
                    }
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, remote_addr: SocketAddr) {
        counter!("signal_relay_connections_total", 1);
        let registry = self.registry.clone();
        let handshake_timeout = self.config.handshake_timeout;
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(async move {
            let socket = match handshake(stream, handshake_timeout).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(%remote_addr, error = %err, "dropping connection before session start");
                    return;
                }
            };

            let handler = SessionHandler::new(socket, registry, Some(remote_addr))
                .with_idle_timeout(idle_timeout);
            let connection_id = handler.connection_id();
            debug!(%connection_id, %remote_addr, "connection accepted");

            let reason = handler.run().await;
            debug!(%connection_id, reason = reason.as_str(), "connection finished");
        });
    }
}

/// Retry `accept` up to `retries` times in a row, sleeping `backoff * attempt`
/// between failures. Exhausting the retries gives up on this incoming
/// connection only; the listener keeps running.
async fn accept_with_retry<T, F, Fut>(mut accept: F, retries: u32, backoff: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    for attempt in 1..=retries {
        match accept().await {
            Ok(accepted) => return Some(accepted),
            Err(err) => {
                counter!("signal_relay_accept_errors_total", 1);
                warn!(attempt, retries, error = %err, "failed to accept connection");
                if attempt < retries {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }
    error!(retries, "giving up on incoming connection");
    None
}

async fn handshake(
    stream: TcpStream,
    limit: Duration,
) -> RelayResult<WebSocketStream<TcpStream>> {
    let _ = stream.set_nodelay(true);
    match tokio::time::timeout(limit, accept_async(stream)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RelayError::HandshakeTimeout),
    }
}
