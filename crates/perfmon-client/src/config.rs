use perfmon_common::backoff::BackoffConfig;
use perfmon_common::channel::DEFAULT_MAX_MESSAGE_BYTES;
use perfmon_common::tls::TlsFiles;
use perfmon_common::types::{MetricKind, Subject};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// `host:port` of the ingest server.
    pub server_addr: String,
    /// Name checked against the server certificate.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    pub tls: TlsFiles,
    /// Processes to watch in addition to the host, e.g. `nginx` or `pid:42`.
    #[serde(default)]
    pub subjects: Vec<Subject>,
    /// Metrics to sample; empty means all.
    #[serde(default)]
    pub metrics: Vec<MetricKind>,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_sampling_interval_ms() -> u64 {
    1000
}

fn default_max_batch_size() -> usize {
    512
}

fn default_max_queue_depth() -> usize {
    256
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

impl ClientConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sampling_interval_ms == 0 {
            anyhow::bail!("sampling_interval_ms must be greater than zero");
        }
        if self.max_batch_size == 0 {
            anyhow::bail!("max_batch_size must be greater than zero");
        }
        if self.max_queue_depth == 0 {
            anyhow::bail!("max_queue_depth must be greater than zero");
        }
        if self.max_message_bytes == 0 {
            anyhow::bail!("max_message_bytes must be greater than zero");
        }
        Ok(())
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }
}
