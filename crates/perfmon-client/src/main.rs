use anyhow::Result;
use perfmon_client::client::{spawn_sampler, Client, ClientSettings};
use perfmon_client::config::ClientConfig;
use perfmon_client::connector::TlsClientConnector;
use perfmon_collector::sampler::MetricSampler;
use perfmon_collector::system::SystemCounters;
use perfmon_common::tls;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("perfmon=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/client.toml".to_string());
    let config = ClientConfig::load(&config_path)?;

    let identity = tls::local_identity(&config.tls)?;
    let connector = TlsClientConnector::from_config(&config)?;
    tracing::info!(
        client = %identity,
        server = %config.server_addr,
        subjects = config.subjects.len(),
        interval_ms = config.sampling_interval_ms,
        "perfmon-client starting"
    );

    let client = Arc::new(Client::new(ClientSettings::from(&config), connector));
    let cancel = CancellationToken::new();

    let sampler = MetricSampler::new(SystemCounters::new(), identity, config.metrics.clone());
    let subjects: BTreeSet<_> = config.subjects.iter().cloned().collect();
    let sampling = spawn_sampler(
        sampler,
        subjects,
        config.sampling_interval(),
        config.max_batch_size,
        client.queue(),
        cancel.clone(),
    );

    let sender = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = client.run(cancel.clone()).await;
            // Gave up reconnecting: stop sampling too.
            cancel.cancel();
            outcome
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Shutting down gracefully");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let outcome = sender.await?;
    sampling.await?;
    let stats = client.stats();
    tracing::info!(
        sent = stats.sent,
        dropped = stats.dropped,
        requeued = stats.requeued,
        pending = client.queue().len(),
        "perfmon-client stopped"
    );
    outcome?;
    Ok(())
}
