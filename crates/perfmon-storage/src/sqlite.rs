use crate::error::{Result, SinkError};
use crate::partition::PartitionManager;
use crate::{PartitionInfo, SampleQuery, Sink, StoredSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perfmon_common::types::{Batch, MetricKind};
use std::path::Path;
use std::sync::Arc;

/// Day-partitioned SQLite sink.
///
/// A batch lands whole in the partition of its earliest capture time, so a
/// batch that straddles midnight is never split across two databases.
#[derive(Clone)]
pub struct SqliteSink {
    partitions: Arc<PartitionManager>,
}

impl SqliteSink {
    pub fn new(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            partitions: Arc::new(PartitionManager::new(data_dir)?),
        })
    }

    /// Synchronous write used by [`Sink::append`] on a blocking worker.
    pub fn write_batch(&self, batch: &Batch, received_at: DateTime<Utc>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let day = batch.earliest_capture().unwrap_or(received_at);
        let key = self.partitions.get_or_create(day)?;
        self.partitions.with_partition(&key, |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO samples (id, client, sequence, subject, metric, value, captured_at, monotonic_ns, received_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for sample in &batch.samples {
                    stmt.execute(rusqlite::params![
                        perfmon_common::id::next_id(),
                        batch.client.as_str(),
                        batch.sequence as i64,
                        &sample.subject,
                        sample.metric.as_str(),
                        sample.value,
                        sample.timestamp.wall.timestamp_micros(),
                        sample.timestamp.monotonic_ns as i64,
                        received_at.timestamp_micros(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Samples for one client captured within `from..=to`, oldest first.
    pub fn query(&self, query: &SampleQuery) -> Result<Vec<StoredSample>> {
        let keys = self.partitions.partitions_in_range(query.from, query.to)?;
        let mut results = Vec::new();

        for key in keys {
            self.partitions.with_partition(&key, |conn| {
                let mut sql = String::from(
                    "SELECT id, client, sequence, subject, metric, value, captured_at, monotonic_ns, received_at
                     FROM samples WHERE client = ?1 AND captured_at >= ?2 AND captured_at <= ?3",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
                    Box::new(query.client.clone()),
                    Box::new(query.from.timestamp_micros()),
                    Box::new(query.to.timestamp_micros()),
                ];
                if let Some(subject) = &query.subject {
                    params.push(Box::new(subject.clone()));
                    sql.push_str(&format!(" AND subject = ?{}", params.len()));
                }
                if let Some(metric) = query.metric {
                    params.push(Box::new(metric.as_str()));
                    sql.push_str(&format!(" AND metric = ?{}", params.len()));
                }
                sql.push_str(" ORDER BY captured_at ASC, monotonic_ns ASC");

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let rows = stmt.query_map(param_refs.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                })?;

                for row in rows {
                    let (id, client, sequence, subject, metric, value, captured, mono, received) =
                        row?;
                    let metric: MetricKind = metric.parse().map_err(|detail| SinkError::Corrupt {
                        column: "metric",
                        detail,
                    })?;
                    results.push(StoredSample {
                        id,
                        client,
                        sequence: sequence as u64,
                        subject,
                        metric,
                        value,
                        captured_at: from_micros("captured_at", captured)?,
                        monotonic_ns: mono as u64,
                        received_at: from_micros("received_at", received)?,
                    });
                }
                Ok(())
            })?;
        }

        results.sort_by_key(|s| (s.captured_at, s.monotonic_ns));
        Ok(results)
    }

    pub fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        self.partitions.list_partition_info()
    }

    pub fn data_dir(&self) -> &Path {
        self.partitions.data_dir()
    }
}

fn from_micros(column: &'static str, micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| SinkError::Corrupt {
        column,
        detail: format!("timestamp {micros} out of range"),
    })
}

#[async_trait]
impl Sink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(&self, batch: &Batch) -> Result<()> {
        let sink = self.clone();
        let batch = batch.clone();
        let received_at = Utc::now();
        tokio::task::spawn_blocking(move || sink.write_batch(&batch, received_at))
            .await
            .map_err(|e| SinkError::Worker(e.to_string()))?
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u32> {
        let partitions = self.partitions.clone();
        tokio::task::spawn_blocking(move || partitions.cleanup_older_than(retention_days))
            .await
            .map_err(|e| SinkError::Worker(e.to_string()))?
    }
}
