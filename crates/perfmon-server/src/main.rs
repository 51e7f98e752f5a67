use anyhow::Result;
use perfmon_common::tls;
use perfmon_server::config::ServerConfig;
use perfmon_server::ingest::{IngestServer, IngestSettings};
use perfmon_server::retention;
use perfmon_server::sink::build_sink;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    perfmon_common::id::init(1, 1);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("perfmon=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/server.toml".to_string());
    let config = ServerConfig::load(&config_path)?;

    let acceptor = TlsAcceptor::from(tls::server_config(&config.tls)?);
    let sink = build_sink(&config.sink)?;
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(
        listen = %listener.local_addr()?,
        sink = sink.name(),
        data_dir = %config.sink.data_dir,
        allowed_clients = config.allowed_clients.len(),
        "perfmon-server started"
    );

    let cancel = CancellationToken::new();
    let cleanup = retention::spawn_cleanup(
        sink.clone(),
        config.sink.retention_days,
        Duration::from_secs(config.sink.cleanup_interval_secs),
        cancel.clone(),
    );

    let server = Arc::new(IngestServer::new(IngestSettings::from(&config), sink));
    let serving = tokio::spawn(server.clone().run(listener, acceptor, cancel.clone()));

    let mut report = tokio::time::interval(STATS_INTERVAL);
    report.tick().await;
    loop {
        tokio::select! {
            r = signal::ctrl_c() => {
                r?;
                break;
            }
            _ = report.tick() => {
                let stats = server.stats();
                tracing::info!(
                    active = server.active_connections(),
                    batches = stats.batches,
                    samples = stats.samples,
                    receive_rate = stats.receive_rate,
                    emit_rate = stats.emit_rate,
                    "Ingest throughput"
                );
            }
        }
    }
    tracing::info!("Shutting down gracefully");
    cancel.cancel();

    serving.await?;
    cleanup.await?;
    let stats = server.stats();
    tracing::info!(
        connections = stats.connections,
        batches = stats.batches,
        samples = stats.samples,
        terminated = stats.terminated,
        "Server stopped"
    );
    Ok(())
}
