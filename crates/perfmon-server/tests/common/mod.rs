#![allow(dead_code)]

use perfmon_common::backoff::BackoffConfig;
use perfmon_common::channel::{SecureChannel, DEFAULT_MAX_MESSAGE_BYTES};
use perfmon_common::tls::TlsFiles;
use perfmon_common::types::{Batch, CaptureInstant, ClientIdentity, MetricKind, Sample};
use perfmon_server::ingest::IngestSettings;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::DuplexStream;

pub fn settings(allowed: &[&str], sink_attempts: u32) -> IngestSettings {
    IngestSettings {
        max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        handshake_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        allowed_clients: allowed.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
        sink_retry: BackoffConfig {
            initial_ms: 1,
            max_ms: 5,
            max_attempts: sink_attempts,
        },
    }
}

/// Both ends of an in-memory channel: (client, server).
pub fn duplex_pair() -> (SecureChannel<DuplexStream>, SecureChannel<DuplexStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        SecureChannel::new(a, DEFAULT_MAX_MESSAGE_BYTES),
        SecureChannel::new(b, DEFAULT_MAX_MESSAGE_BYTES),
    )
}

pub fn batch(client: &str, sequence: u64, readings: &[(&str, MetricKind, f64)]) -> Batch {
    let epoch = Instant::now();
    Batch {
        sequence,
        client: ClientIdentity::new(client),
        samples: readings
            .iter()
            .map(|(subject, metric, value)| Sample {
                subject: subject.to_string(),
                metric: *metric,
                value: *value,
                timestamp: CaptureInstant::now_since(epoch),
            })
            .collect(),
    }
}

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/tls")
        .join(name)
}

pub fn tls_files(leaf: &str) -> TlsFiles {
    TlsFiles {
        cert_path: fixture(&format!("{leaf}.pem")),
        key_path: fixture(&format!("{leaf}-key.pem")),
        ca_path: fixture("ca.pem"),
    }
}
