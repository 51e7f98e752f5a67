use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::sink::append_with_retry;
use crate::throughput::ThroughputWindow;
use chrono::Utc;
use perfmon_common::backoff::BackoffConfig;
use perfmon_common::channel::SecureChannel;
use perfmon_common::codec;
use perfmon_common::error::{ErrorKind, PipelineError};
use perfmon_common::tls;
use perfmon_storage::Sink;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub max_message_bytes: usize,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Empty accepts every authenticated identity.
    pub allowed_clients: HashSet<String>,
    pub sink_retry: BackoffConfig,
}

impl From<&ServerConfig> for IngestSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            allowed_clients: config.allowed_clients.iter().cloned().collect(),
            sink_retry: config.sink_retry.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    batches: AtomicU64,
    samples: AtomicU64,
    terminated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestStats {
    /// Connections that completed the handshake and passed authorization.
    pub connections: u64,
    /// Batches forwarded to the sink and acknowledged.
    pub batches: u64,
    /// Samples in those batches.
    pub samples: u64,
    /// Connections closed because of an error.
    pub terminated: u64,
    /// Samples stored during the last second.
    pub receive_rate: u64,
    /// Samples stored during the last second that were also captured in it.
    pub emit_rate: u64,
}

pub struct IngestServer {
    settings: IngestSettings,
    sink: Arc<dyn Sink>,
    tracker: TaskTracker,
    counters: Counters,
    throughput: Mutex<ThroughputWindow>,
}

impl IngestServer {
    pub fn new(settings: IngestSettings, sink: Arc<dyn Sink>) -> Self {
        Self {
            settings,
            sink,
            tracker: TaskTracker::new(),
            counters: Counters::default(),
            throughput: Mutex::new(ThroughputWindow::new()),
        }
    }

    fn throughput(&self) -> MutexGuard<'_, ThroughputWindow> {
        self.throughput
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> IngestStats {
        let (receive_rate, emit_rate) = self.throughput().rates(Utc::now());
        IngestStats {
            connections: self.counters.connections.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            samples: self.counters.samples.load(Ordering::Relaxed),
            terminated: self.counters.terminated.load(Ordering::Relaxed),
            receive_rate,
            emit_rate,
        }
    }

    /// Connection tasks still running.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_allowed(&self, identity: &str) -> bool {
        self.settings.allowed_clients.is_empty() || self.settings.allowed_clients.contains(identity)
    }

    /// Accepts connections until `cancel` fires, then waits up to the shutdown
    /// grace period for connection tasks to finish.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((tcp, peer_addr)) => {
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    let cancel = cancel.child_token();
                    self.tracker.spawn(async move {
                        server.handle_socket(tcp, peer_addr, acceptor, cancel).await;
                    });
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        self.tracker.close();
        tracing::info!(active = self.tracker.len(), "Listener stopped, draining connections");
        if tokio::time::timeout(self.settings.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Connections still open after shutdown grace period"
            );
        }
    }

    async fn handle_socket(
        &self,
        tcp: TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
        cancel: CancellationToken,
    ) {
        let handshake = tokio::time::timeout(
            self.settings.handshake_timeout,
            tls::accept(&acceptor, tcp, self.settings.max_message_bytes),
        );
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            r = handshake => r,
        };
        let (mut channel, peer) = match outcome {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_addr, error = %e, kind = %e.kind(), "Handshake failed");
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer_addr, "Handshake timed out");
                return;
            }
        };

        if !self.is_allowed(peer.identity.as_str()) {
            let e = PipelineError::AuthenticationFailure(format!(
                "client '{}' is not in allowed_clients",
                peer.identity
            ));
            tracing::warn!(peer = %peer_addr, client = %peer.identity, error = %e, kind = %e.kind(), "Connection rejected");
            let _ = channel.close().await;
            return;
        }

        tracing::info!(
            peer = %peer_addr,
            client = %peer.identity,
            protocol = %peer.protocol,
            cipher_suite = %peer.cipher_suite,
            "Client connected"
        );
        let _ = self.serve_connection(Connection::from(peer), channel, cancel).await;
    }

    /// Runs the receive, validate, store, ack loop for one authenticated
    /// channel.
    ///
    /// Returns the number of batches accepted once the client disconnects
    /// or `cancel` fires. Any error terminates the connection.
    pub async fn serve_connection<S>(
        &self,
        mut connection: Connection,
        mut channel: SecureChannel<S>,
        cancel: CancellationToken,
    ) -> Result<u64, PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        let result = self.ingest(&mut connection, &mut channel, &cancel).await;
        let _ = channel.close().await;

        let client = connection.identity();
        match &result {
            Ok(accepted) => {
                tracing::info!(client = %client, accepted, "Client disconnected");
            }
            Err(e) => {
                self.counters.terminated.fetch_add(1, Ordering::Relaxed);
                let last = connection.last_acknowledged();
                match e.kind() {
                    ErrorKind::ProtocolViolation | ErrorKind::SinkUnavailable => tracing::error!(
                        client = %client,
                        last_acknowledged = last,
                        error = %e,
                        kind = %e.kind(),
                        "Connection terminated"
                    ),
                    _ => tracing::warn!(
                        client = %client,
                        last_acknowledged = last,
                        error = %e,
                        kind = %e.kind(),
                        "Connection lost"
                    ),
                }
            }
        }
        result
    }

    async fn ingest<S>(
        &self,
        connection: &mut Connection,
        channel: &mut SecureChannel<S>,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(connection.accepted()),
                r = channel.receive() => r?,
            };
            let Some(frame) = frame else {
                return Ok(connection.accepted());
            };

            let batch = codec::decode(&frame)?;
            connection.check(&batch)?;
            append_with_retry(self.sink.as_ref(), &batch, &self.settings.sink_retry).await?;
            connection.acknowledge(batch.sequence);
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            self.counters
                .samples
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.throughput().record(&batch, Utc::now());
            tracing::debug!(
                client = %batch.client,
                sequence = batch.sequence,
                samples = batch.len(),
                "Batch stored"
            );
            channel.send(codec::encode_ack(batch.sequence)).await?;
        }
    }
}
