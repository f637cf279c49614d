use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{signal, sync::watch};
use tracing::{error, info};

use signal_relay::{
    admin::{self, AdminState},
    cli::{self, Cli, Commands},
    telemetry::{self, Telemetry},
    RelayConfig, RelayServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Connect(args)) = cli.command {
        telemetry::init_tracing()?;
        return cli::run_client(args).await;
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        admin_addr = ?config.admin_addr,
        accept_retries = config.accept_retries,
        idle_timeout = ?config.idle_timeout,
        "starting signal relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let server = RelayServer::bind(config.clone()).await?;
    let registry = server.registry();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_task = match config.admin_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind admin listener on {addr}"))?;
            info!("admin endpoint listening on {}", addr);

            let app = admin::router(AdminState {
                registry,
                metrics: Some(metrics),
            });
            let mut admin_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = admin_shutdown.changed().await;
                    })
                    .await
            }))
        }
        None => None,
    };

    let mut relay_shutdown = shutdown_rx;
    let relay_task = tokio::spawn(server.run(async move {
        let _ = relay_shutdown.changed().await;
    }));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Err(err) = relay_task.await {
        error!(error = %err, "relay listener task failed");
    }
    if let Some(task) = admin_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "admin server exited with error"),
            Err(err) => error!(error = %err, "admin server task failed"),
        }
    }

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; waiting for sessions to drain"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
