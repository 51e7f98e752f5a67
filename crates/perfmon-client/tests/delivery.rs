use anyhow::Result;
use async_trait::async_trait;
use perfmon_client::client::{Client, ClientSettings, ClientState};
use perfmon_client::connector::Connector;
use perfmon_common::backoff::BackoffConfig;
use perfmon_common::channel::{SecureChannel, DEFAULT_MAX_MESSAGE_BYTES};
use perfmon_common::codec;
use perfmon_common::error::{ErrorKind, PipelineError};
use perfmon_common::types::{Batch, CaptureInstant, ClientIdentity, MetricKind, Sample};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type ServerEnd = SecureChannel<DuplexStream>;

/// Hands the far end of every new in-memory connection to the test.
struct DuplexConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
    attempts: Arc<AtomicUsize>,
    refuse: bool,
    /// Message limit on the client end.
    max_message_bytes: usize,
}

#[async_trait]
impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<SecureChannel<DuplexStream>, PipelineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.servers
            .send(SecureChannel::new(server, DEFAULT_MAX_MESSAGE_BYTES))
            .map_err(|_| std::io::Error::other("test server gone"))?;
        Ok(SecureChannel::new(client, self.max_message_bytes))
    }
}

fn settings(send_timeout_ms: u64, max_attempts: u32) -> ClientSettings {
    ClientSettings {
        send_timeout: Duration::from_millis(send_timeout_ms),
        handshake_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(1),
        max_queue_depth: 16,
        reconnect: BackoffConfig {
            initial_ms: 10,
            max_ms: 40,
            max_attempts,
        },
    }
}

type Harness = (DuplexConnector, mpsc::UnboundedReceiver<ServerEnd>, Arc<AtomicUsize>);

fn connector(refuse: bool) -> Harness {
    connector_with_limit(refuse, DEFAULT_MAX_MESSAGE_BYTES)
}

fn connector_with_limit(refuse: bool, max_message_bytes: usize) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = DuplexConnector {
        servers: tx,
        attempts: attempts.clone(),
        refuse,
        max_message_bytes,
    };
    (connector, rx, attempts)
}

fn batch(sequence: u64) -> Batch {
    Batch {
        sequence,
        client: ClientIdentity::new("svc"),
        samples: vec![Sample {
            subject: "svc".into(),
            metric: MetricKind::CpuTime,
            value: sequence as f64,
            timestamp: CaptureInstant::now_since(Instant::now()),
        }],
    }
}

/// Receives one batch from the server end.
async fn receive_batch(server: &mut ServerEnd) -> Result<Batch> {
    let frame = server
        .receive()
        .await?
        .ok_or_else(|| anyhow::anyhow!("client closed the connection"))?;
    Ok(codec::decode(&frame)?)
}

/// Acks everything until the client hangs up.
async fn ack_all(mut server: ServerEnd) -> Result<Vec<u64>> {
    let mut seen = Vec::new();
    while let Some(frame) = server.receive().await? {
        let batch = codec::decode(&frame)?;
        seen.push(batch.sequence);
        server.send(codec::encode_ack(batch.sequence)).await?;
    }
    Ok(seen)
}

async fn wait_for(client: &Client<DuplexConnector>, state: ClientState) -> Result<()> {
    let mut rx = client.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state)).await??;
    Ok(())
}

#[tokio::test]
async fn batches_are_delivered_in_order_and_acknowledged() -> Result<()> {
    let (connector, mut servers, _) = connector(false);
    let client = Arc::new(Client::new(settings(1000, 0), connector));
    let cancel = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    let server = tokio::spawn(ack_all(servers.recv().await.unwrap()));
    wait_for(&client, ClientState::Streaming).await?;
    for seq in 1..=3 {
        client.queue().push(batch(seq));
    }
    while client.stats().sent < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    runner.await??;
    assert_eq!(server.await??, vec![1, 2, 3]);
    assert_eq!(client.state(), ClientState::Stopped);
    assert_eq!(
        client.stats(),
        perfmon_client::client::ClientStats {
            sent: 3,
            dropped: 0,
            requeued: 0
        }
    );
    Ok(())
}

#[tokio::test]
async fn send_timeout_requeues_once_then_drops() -> Result<()> {
    let (connector, mut servers, attempts) = connector(false);
    let client = Arc::new(Client::new(settings(50, 0), connector));
    let cancel = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    // The first server never acks.
    let mut first = servers.recv().await.unwrap();
    wait_for(&client, ClientState::Streaming).await?;
    client.queue().push(batch(1));
    assert_eq!(receive_batch(&mut first).await?.sequence, 1);

    // The client recycles the connection and retries the same batch, which
    // is also left unacknowledged.
    let mut second = servers.recv().await.unwrap();
    assert_eq!(receive_batch(&mut second).await?.sequence, 1);

    let third = servers.recv().await.unwrap();
    let server = tokio::spawn(ack_all(third));
    client.queue().push(batch(2));
    while client.stats().sent < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    runner.await??;
    let stats = client.stats();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(server.await??, vec![2]);
    assert!(attempts.load(Ordering::SeqCst) >= 3);
    drop((first, second));
    Ok(())
}

#[tokio::test]
async fn transport_error_requeues_for_next_connection() -> Result<()> {
    let (connector, mut servers, _) = connector(false);
    let client = Arc::new(Client::new(settings(1000, 0), connector));
    let cancel = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    let mut first = servers.recv().await.unwrap();
    wait_for(&client, ClientState::Streaming).await?;
    client.queue().push(batch(7));
    assert_eq!(receive_batch(&mut first).await?.sequence, 7);
    drop(first);

    let server = tokio::spawn(ack_all(servers.recv().await.unwrap()));
    while client.stats().sent < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    runner.await??;

    assert_eq!(server.await??, vec![7]);
    let stats = client.stats();
    assert_eq!((stats.sent, stats.requeued, stats.dropped), (1, 1, 0));
    Ok(())
}

#[tokio::test]
async fn gives_up_after_reconnect_budget() -> Result<()> {
    let (connector, _servers, attempts) = connector(true);
    let client = Client::new(settings(1000, 2), connector);

    let err = client.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientIo);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.state(), ClientState::Stopped);
    Ok(())
}

#[tokio::test]
async fn shutdown_flushes_queued_batches() -> Result<()> {
    let (connector, mut servers, _) = connector(false);
    let client = Arc::new(Client::new(settings(1000, 0), connector));
    let cancel = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    let server = tokio::spawn(ack_all(servers.recv().await.unwrap()));
    wait_for(&client, ClientState::Streaming).await?;
    for seq in 1..=4 {
        client.queue().push(batch(seq));
    }
    cancel.cancel();
    runner.await??;

    assert_eq!(server.await??, vec![1, 2, 3, 4]);
    assert_eq!(client.stats().sent, 4);
    assert!(client.queue().is_empty());
    Ok(())
}

#[tokio::test]
async fn queue_overflow_counts_as_dropped() -> Result<()> {
    let (connector, _servers, _) = connector(true);
    let mut s = settings(1000, 1);
    s.max_queue_depth = 2;
    let client = Client::new(s, connector);
    for seq in 1..=5 {
        client.queue().push(batch(seq));
    }
    assert_eq!(client.stats().dropped, 3);
    assert_eq!(client.queue().pop().map(|p| p.batch.sequence), Some(4));
    Ok(())
}

#[tokio::test]
async fn batch_failing_twice_is_dropped() -> Result<()> {
    let (connector, mut servers, _) = connector(false);
    let client = Arc::new(Client::new(settings(1000, 0), connector));
    let cancel = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    // Both servers hang up on batch 1 instead of acknowledging it.
    wait_for(&client, ClientState::Streaming).await?;
    client.queue().push(batch(1));
    for _ in 0..2 {
        let mut server = servers.recv().await.unwrap();
        assert_eq!(receive_batch(&mut server).await?.sequence, 1);
        drop(server);
    }

    let server = tokio::spawn(ack_all(servers.recv().await.unwrap()));
    wait_for(&client, ClientState::Streaming).await?;
    assert!(client.queue().is_empty());
    client.queue().push(batch(2));
    while client.stats().sent < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    runner.await??;
    assert_eq!(server.await??, vec![2]);
    let stats = client.stats();
    assert_eq!((stats.sent, stats.requeued, stats.dropped), (1, 1, 1));
    Ok(())
}

#[tokio::test]
async fn oversized_batch_is_dropped_without_reconnecting() -> Result<()> {
    let (connector, mut servers, attempts) = connector_with_limit(false, 128);
    let client = Arc::new(Client::new(settings(1000, 0), connector));
    let cancel = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    let server = tokio::spawn(ack_all(servers.recv().await.unwrap()));
    wait_for(&client, ClientState::Streaming).await?;
    let mut oversized = batch(1);
    oversized.samples[0].subject = "x".repeat(256);
    client.queue().push(oversized);
    client.queue().push(batch(2));
    while client.stats().sent < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    runner.await??;
    assert_eq!(server.await??, vec![2]);
    let stats = client.stats();
    assert_eq!((stats.sent, stats.requeued, stats.dropped), (1, 0, 1));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    Ok(())
}
