use crate::config::{SinkConfig, SinkKind};
use perfmon_common::backoff::{Backoff, BackoffConfig};
use perfmon_common::error::PipelineError;
use perfmon_common::types::Batch;
use perfmon_storage::elastic::ElasticSink;
use perfmon_storage::jsonl::JsonLinesSink;
use perfmon_storage::sqlite::SqliteSink;
use perfmon_storage::{Sink, SinkError};
use std::path::Path;
use std::sync::Arc;

pub fn build_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>, SinkError> {
    let dir = Path::new(&config.data_dir);
    let sink: Arc<dyn Sink> = match config.kind {
        SinkKind::Sqlite => Arc::new(SqliteSink::new(dir)?),
        SinkKind::Jsonl => Arc::new(JsonLinesSink::new(dir)?),
        SinkKind::Elastic => Arc::new(ElasticSink::new(&config.elastic)?),
    };
    Ok(sink)
}

/// Appends `batch`, retrying failures with backoff until the retry budget in
/// `retry` is spent.
pub async fn append_with_retry(
    sink: &dyn Sink,
    batch: &Batch,
    retry: &BackoffConfig,
) -> Result<(), PipelineError> {
    let mut backoff = Backoff::new(retry);
    loop {
        let err = match sink.append(batch).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let Some(delay) = backoff.next_delay() else {
            return Err(PipelineError::SinkUnavailable {
                attempts: backoff.attempts() + 1,
                reason: err.to_string(),
            });
        };
        tracing::warn!(
            sink = sink.name(),
            client = %batch.client,
            sequence = batch.sequence,
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Sink append failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
