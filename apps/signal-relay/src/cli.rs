use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::envelope::{ClientEnvelope, ServerEnvelope};

#[derive(Parser, Debug)]
#[command(name = "signal-relay", version)]
#[command(about = "WebSocket signaling relay for peer-to-peer calls")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server options (used when no subcommand is given)
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address the WebSocket relay listens on.
    #[arg(long, env = "SIGNAL_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Address for /health, /participants and /metrics. Empty disables it.
    #[arg(long, env = "SIGNAL_RELAY_ADMIN_ADDR", default_value = "0.0.0.0:8001")]
    pub admin_addr: String,

    /// Consecutive accept failures tolerated per incoming connection.
    #[arg(long, env = "SIGNAL_RELAY_ACCEPT_RETRIES", default_value_t = 3)]
    pub accept_retries: u32,

    #[arg(long, env = "SIGNAL_RELAY_ACCEPT_BACKOFF_MS", default_value_t = 100)]
    pub accept_backoff_ms: u64,

    /// Maximum time for a client to complete the WebSocket handshake.
    #[arg(long, env = "SIGNAL_RELAY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Close sessions that stay silent this long. 0 disables the timeout.
    #[arg(long, env = "SIGNAL_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SIGNAL_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a running relay as a participant and print what it relays
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Relay URL (e.g., ws://localhost:8000)
    #[arg(short, long, default_value = "ws://127.0.0.1:8000")]
    pub url: String,

    /// Identifier to join as
    #[arg(long)]
    pub id: String,

    /// Participant to send one envelope to after joining
    #[arg(long, requires = "action")]
    pub to: Option<String>,

    #[arg(long, value_enum, requires = "to")]
    pub action: Option<SendAction>,

    /// JSON payload for offer, answer and ice-candidate
    #[arg(long)]
    pub payload: Option<String>,

    /// How long to keep printing inbound envelopes
    #[arg(long, default_value_t = 5)]
    pub listen_secs: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAction {
    Offer,
    Answer,
    IceCandidate,
    EndCall,
    CallRejected,
}

fn build_envelope(action: SendAction, to: String, payload: Option<&str>) -> Result<ClientEnvelope> {
    let payload = payload
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--payload is not valid JSON")?;
    let require = |payload: Option<Value>| {
        payload.ok_or_else(|| anyhow!("--payload is required for {:?}", action))
    };

    Ok(match action {
        SendAction::Offer => ClientEnvelope::Offer {
            to,
            offer: require(payload)?,
        },
        SendAction::Answer => ClientEnvelope::Answer {
            to,
            answer: require(payload)?,
        },
        SendAction::IceCandidate => ClientEnvelope::IceCandidate {
            to,
            candidate: require(payload)?,
        },
        SendAction::EndCall => ClientEnvelope::EndCall { to },
        SendAction::CallRejected => ClientEnvelope::CallRejected { to },
    })
}

pub async fn run_client(args: ConnectArgs) -> Result<()> {
    let outgoing = match (args.action, args.to) {
        (Some(action), Some(to)) => Some(build_envelope(action, to, args.payload.as_deref())?),
        _ => None,
    };

    debug!("Connecting to {} as {}", args.url, args.id);
    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&args.url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", args.url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            bail!("Connection timeout - is the relay running?");
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = serde_json::to_string(&ClientEnvelope::Join {
        id: args.id.clone(),
    })?;
    write.send(Message::Text(join.into())).await?;

    let joined = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                if let Ok(ServerEnvelope::Joined { id }) = serde_json::from_str(text.as_str()) {
                    return Ok::<_, anyhow::Error>(id);
                }
            }
        }
        Err(anyhow!("Connection closed before join was acknowledged"))
    })
    .await
    .map_err(|_| anyhow!("Timeout waiting for join acknowledgement"))??;
    println!("joined as {}", joined);

    if let Some(envelope) = outgoing {
        let text = serde_json::to_string(&envelope)?;
        println!("sent {}", text);
        write.send(Message::Text(text.into())).await?;
    }

    let deadline = Instant::now() + Duration::from_secs(args.listen_secs);
    loop {
        match timeout_at(deadline, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => println!("{}", text.as_str()),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                println!("relay closed the connection");
                return Ok(());
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(anyhow!("Receive failed: {}", e)),
            Err(_) => break,
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn connect_requires_action_with_target() {
        assert!(Cli::try_parse_from(["signal-relay", "connect", "--id", "a", "--to", "b"]).is_err());

        let cli = Cli::try_parse_from([
            "signal-relay",
            "connect",
            "--id",
            "soldier1",
            "--to",
            "commander1",
            "--action",
            "ice-candidate",
            "--payload",
            r#"{"candidate":"c"}"#,
        ])
        .unwrap();
        let Some(Commands::Connect(args)) = cli.command else {
            panic!("expected connect command");
        };
        assert_eq!(args.action, Some(SendAction::IceCandidate));
        assert_eq!(args.to.as_deref(), Some("commander1"));
    }

    #[test_timeout::timeout]
    fn payload_is_required_for_sdp_and_ice() {
        assert!(build_envelope(SendAction::Offer, "b".into(), None).is_err());
        assert!(build_envelope(SendAction::Answer, "b".into(), Some("{not json")).is_err());

        let offer = build_envelope(SendAction::Offer, "b".into(), Some(r#"{"sdp":"X"}"#)).unwrap();
        assert_eq!(
            offer,
            ClientEnvelope::Offer {
                to: "b".into(),
                offer: json!({ "sdp": "X" }),
            }
        );

        let end = build_envelope(SendAction::EndCall, "b".into(), None).unwrap();
        assert_eq!(end, ClientEnvelope::EndCall { to: "b".into() });
    }
}
