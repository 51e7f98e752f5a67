use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::queue::{BatchQueue, Pending};
use perfmon_collector::sampler::MetricSampler;
use perfmon_collector::CounterSource;
use perfmon_common::backoff::{Backoff, BackoffConfig};
use perfmon_common::channel::SecureChannel;
use perfmon_common::codec;
use perfmon_common::error::{ErrorKind, PipelineError, ProtocolViolation};
use perfmon_common::types::Subject;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    Streaming,
    /// Shut down, or gave up reconnecting.
    Stopped,
}

/// Timing and sizing knobs for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_queue_depth: usize,
    pub reconnect: BackoffConfig,
}

impl From<&ClientConfig> for ClientSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            max_queue_depth: config.max_queue_depth,
            reconnect: config.reconnect.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStats {
    /// Batches acknowledged by the server.
    pub sent: u64,
    /// Batches given up on: queue overflow, a second failed delivery, or too
    /// large to ever send.
    pub dropped: u64,
    /// Batches put back on the queue after a failed delivery.
    pub requeued: u64,
}

/// Delivery side of the client: owns the pending queue and the connection
/// state machine.
pub struct Client<C> {
    settings: ClientSettings,
    connector: C,
    queue: Arc<BatchQueue>,
    counters: Counters,
    state: watch::Sender<ClientState>,
}

impl<C: Connector> Client<C> {
    pub fn new(settings: ClientSettings, connector: C) -> Self {
        let queue = Arc::new(BatchQueue::new(settings.max_queue_depth));
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            settings,
            connector,
            queue,
            counters: Counters::default(),
            state,
        }
    }

    /// Producer handle for the sampling task.
    pub fn queue(&self) -> Arc<BatchQueue> {
        self.queue.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed) + self.queue.dropped(),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, next: ClientState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Client state changed");
        }
    }

    /// Connects, streams queued batches and reconnects with backoff until
    /// `cancel` fires or the reconnect budget is spent.
    ///
    /// On cancellation while connected, queued batches get one final flush
    /// bounded by the shutdown grace period before the channel is closed.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once `reconnect.max_attempts`
    /// consecutive attempts have failed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut backoff = Backoff::new(&self.settings.reconnect);

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            self.set_state(ClientState::Handshaking);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                r = tokio::time::timeout(self.settings.handshake_timeout, self.connector.connect()) => r,
            };

            let error = match attempt {
                Ok(Ok(mut channel)) => {
                    backoff.reset();
                    self.set_state(ClientState::Streaming);
                    tracing::info!("Connected to ingest server");
                    match self.stream(&mut channel, &cancel).await {
                        Ok(()) => {
                            self.flush(&mut channel).await;
                            if let Err(e) = channel.close().await {
                                tracing::debug!(error = %e, "Error closing channel");
                            }
                            break Ok(());
                        }
                        Err(e) => {
                            let _ = channel.close().await;
                            e
                        }
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => PipelineError::timed_out("handshake"),
            };

            self.set_state(ClientState::Disconnected);
            if error.kind() == ErrorKind::AuthenticationFailure {
                tracing::error!(error = %error, "Handshake rejected");
            } else {
                tracing::warn!(error = %error, kind = %error.kind(), "Connection lost");
            }

            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    attempts = backoff.attempts(),
                    pending = self.queue.len(),
                    "Reconnect attempts exhausted, giving up"
                );
                break Err(error);
            };
            tracing::info!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempts(), "Reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.set_state(ClientState::Stopped);
        result
    }

    async fn stream<S>(
        &self,
        channel: &mut SecureChannel<S>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let pending = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                p = self.queue.next() => p,
            };
            self.deliver(channel, pending).await?;
        }
    }

    async fn flush<S>(&self, channel: &mut SecureChannel<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let drain = async {
            while let Some(pending) = self.queue.pop() {
                self.deliver(channel, pending).await?;
            }
            Ok::<(), PipelineError>(())
        };
        match tokio::time::timeout(self.settings.shutdown_grace, drain).await {
            Ok(Ok(())) => tracing::info!("Flushed pending batches"),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, remaining = self.queue.len(), "Final flush failed")
            }
            Err(_) => tracing::warn!(remaining = self.queue.len(), "Final flush timed out"),
        }
    }

    /// Sends one batch and waits for its ack, both under `send_timeout`.
    ///
    /// Any error means the connection should be recycled. A batch is requeued
    /// at most once: its second failed delivery drops it, as does a batch that
    /// can never fit in a message.
    async fn deliver<S>(
        &self,
        channel: &mut SecureChannel<S>,
        pending: Pending,
    ) -> Result<(), PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sequence = pending.batch.sequence;
        let payload = codec::encode(&pending.batch);
        let outcome =
            tokio::time::timeout(self.settings.send_timeout, exchange(channel, payload, sequence))
                .await;

        match outcome {
            Ok(Ok(())) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(sequence, samples = pending.batch.len(), "Batch acknowledged");
                Ok(())
            }
            Ok(Err(PipelineError::ProtocolViolation(ProtocolViolation::Oversized { max }))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(sequence, max, "Batch exceeds maximum message size, dropped");
                Ok(())
            }
            Ok(Err(e)) if pending.requeued => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sequence, error = %e, kind = %e.kind(), "Send failed again, batch dropped");
                Err(e)
            }
            Ok(Err(e)) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sequence, error = %e, "Send failed, batch requeued");
                self.queue.requeue_front(Pending {
                    batch: pending.batch,
                    requeued: true,
                });
                Err(e)
            }
            Err(_) if pending.requeued => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sequence, "Send timed out again, batch dropped");
                Err(PipelineError::timed_out("send"))
            }
            Err(_) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sequence, "Send timed out, batch requeued");
                self.queue.requeue_front(Pending {
                    batch: pending.batch,
                    requeued: true,
                });
                Err(PipelineError::timed_out("send"))
            }
        }
    }
}

async fn exchange<S>(
    channel: &mut SecureChannel<S>,
    payload: bytes::Bytes,
    sequence: u64,
) -> Result<(), PipelineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel.send(payload).await?;
    let Some(frame) = channel.receive().await? else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "server closed the connection before acknowledging",
        )
        .into());
    };
    let acked = codec::decode_ack(&frame)?;
    if acked != sequence {
        return Err(ProtocolViolation::UnexpectedAck {
            expected: sequence,
            received: acked,
        }
        .into());
    }
    Ok(())
}

/// Samples every `interval` and pushes the resulting batches onto `queue`
/// until `cancel` fires. A failed pass is logged and skipped.
pub fn spawn_sampler<S>(
    mut sampler: MetricSampler<S>,
    subjects: BTreeSet<Subject>,
    interval: Duration,
    max_batch_size: usize,
    queue: Arc<BatchQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: CounterSource + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match sampler.sample_batches(&subjects, max_batch_size) {
                Ok(batches) => {
                    tracing::debug!(batches = batches.len(), queued = queue.len(), "Sampled");
                    for batch in batches {
                        queue.push(batch);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Sampling pass failed"),
            }
        }
        tracing::debug!("Sampler stopped");
    })
}
