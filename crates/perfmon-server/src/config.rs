use perfmon_common::backoff::BackoffConfig;
use perfmon_common::channel::DEFAULT_MAX_MESSAGE_BYTES;
use perfmon_common::tls::TlsFiles;
use perfmon_storage::elastic::ElasticConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub tls: TlsFiles,
    /// Client identities allowed to stream. Empty accepts any certificate
    /// issued by the CA.
    #[serde(default)]
    pub allowed_clients: Vec<String>,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default = "default_sink_retry")]
    pub sink_retry: BackoffConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Sqlite,
    Jsonl,
    Elastic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Used when `kind = "elastic"`.
    #[serde(default)]
    pub elastic: ElasticConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            data_dir: default_data_dir(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            elastic: ElasticConfig::default(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9443".to_string()
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Sqlite
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_sink_retry() -> BackoffConfig {
    BackoffConfig {
        initial_ms: 100,
        max_ms: 2000,
        max_attempts: 5,
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.sink_retry.max_attempts == 0 {
            anyhow::bail!("sink_retry.max_attempts must be greater than zero");
        }
        if config.max_message_bytes == 0 {
            anyhow::bail!("max_message_bytes must be greater than zero");
        }
        if config.sink.cleanup_interval_secs == 0 {
            anyhow::bail!("sink.cleanup_interval_secs must be greater than zero");
        }
        Ok(config)
    }
}
