use perfmon_storage::Sink;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodically removes sink partitions older than `retention_days`. The first
/// pass runs immediately.
pub fn spawn_cleanup(
    sink: Arc<dyn Sink>,
    retention_days: u32,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match sink.cleanup(retention_days).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(sink = sink.name(), removed, "Cleaned up expired partitions")
                }
                Err(e) => tracing::error!(sink = sink.name(), error = %e, "Cleanup failed"),
                _ => {}
            }
        }
    })
}
