use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use crate::cli::ServeArgs;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket relay endpoint
    pub listen_addr: SocketAddr,
    /// HTTP health/diagnostics/metrics endpoint; `None` disables it
    pub admin_addr: Option<SocketAddr>,
    /// Consecutive `accept()` failures tolerated before giving up on that
    /// incoming connection
    pub accept_retries: u32,
    pub accept_backoff: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            admin_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8001))),
            accept_retries: 3,
            accept_backoff: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        let admin_addr = match args.admin_addr.trim() {
            "" => None,
            addr => Some(
                addr.parse()
                    .with_context(|| format!("invalid admin address: {addr}"))?,
            ),
        };

        if args.accept_retries == 0 {
            anyhow::bail!("accept retries must be at least 1");
        }

        Ok(Self {
            listen_addr,
            admin_addr,
            accept_retries: args.accept_retries,
            accept_backoff: Duration::from_millis(args.accept_backoff_ms),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            idle_timeout: match args.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
