//! Durable destinations for received sample batches.
//!
//! Every sink implements [`Sink`]. The server owns a single sink shared by all
//! connection tasks, so implementations must accept concurrent appends.
//!
//! - [`sqlite::SqliteSink`]: daily time-partitioned SQLite databases in WAL mode
//! - [`jsonl::JsonLinesSink`]: daily newline-delimited JSON files for a log shipper
//! - [`elastic::ElasticSink`]: bulk indexing into daily Elasticsearch indices
//! - [`memory::MemorySink`]: in-process recorder with injectable failures

pub mod elastic;
pub mod error;
pub mod jsonl;
pub mod memory;
pub mod partition;
pub mod sqlite;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perfmon_common::types::{Batch, MetricKind};
use serde::Serialize;

pub use error::SinkError;

/// Append-only persistence for sample batches.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &'static str;

    /// Persists every sample of `batch`. Either the whole batch is stored or
    /// an error is returned; a failed append may be retried with the same batch.
    async fn append(&self, batch: &Batch) -> Result<(), SinkError>;

    /// Removes stored data older than `retention_days`. Returns the number of
    /// daily partitions removed. Sinks without retention return `Ok(0)`.
    async fn cleanup(&self, _retention_days: u32) -> Result<u32, SinkError> {
        Ok(0)
    }
}

/// Time-range query over stored samples, scoped to one client.
///
/// # Examples
///
/// ```
/// use perfmon_storage::SampleQuery;
/// use perfmon_common::types::MetricKind;
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let query = SampleQuery {
///     client: "svc".into(),
///     subject: Some("nginx".into()),
///     metric: Some(MetricKind::CpuTime),
///     from: now - Duration::hours(1),
///     to: now,
/// };
/// assert_eq!(query.client, "svc");
/// ```
#[derive(Debug, Clone)]
pub struct SampleQuery {
    pub client: String,
    pub subject: Option<String>,
    pub metric: Option<MetricKind>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// A sample as persisted, with its delivery attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSample {
    pub id: String,
    pub client: String,
    pub sequence: u64,
    pub subject: String,
    pub metric: MetricKind,
    pub value: f64,
    pub captured_at: DateTime<Utc>,
    pub monotonic_ns: u64,
    pub received_at: DateTime<Utc>,
}

/// Information about a storage partition (one UTC day).
#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub date: String,
    pub size_bytes: u64,
    pub path: String,
}

/// Flat document form of one sample, shared by the JSON based sinks.
#[derive(Debug, Serialize)]
pub(crate) struct SampleRecord<'a> {
    pub client: &'a str,
    pub sequence: u64,
    pub subject: &'a str,
    pub metric: MetricKind,
    pub value: f64,
    pub captured_at: DateTime<Utc>,
    pub monotonic_ns: u64,
    pub received_at: DateTime<Utc>,
}

impl<'a> SampleRecord<'a> {
    pub(crate) fn from_batch(
        batch: &'a Batch,
        received_at: DateTime<Utc>,
    ) -> impl Iterator<Item = SampleRecord<'a>> + 'a {
        batch.samples.iter().map(move |sample| SampleRecord {
            client: batch.client.as_str(),
            sequence: batch.sequence,
            subject: &sample.subject,
            metric: sample.metric,
            value: sample.value,
            captured_at: sample.timestamp.wall,
            monotonic_ns: sample.timestamp.monotonic_ns,
            received_at,
        })
    }
}
