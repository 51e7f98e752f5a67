use crate::jsonl::JsonLinesSink;
use crate::memory::MemorySink;
use crate::sqlite::SqliteSink;
use crate::{SampleQuery, Sink, SinkError};
use chrono::{DateTime, Duration, TimeZone, Utc};
use perfmon_common::types::{Batch, CaptureInstant, ClientIdentity, MetricKind, Sample};
use std::sync::Arc;
use tempfile::TempDir;

fn setup() -> (TempDir, SqliteSink) {
    perfmon_common::id::init(1, 1);
    let dir = TempDir::new().unwrap();
    let sink = SqliteSink::new(dir.path()).unwrap();
    (dir, sink)
}

/// Whole seconds so stored microsecond timestamps compare equal.
fn now_secs() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
}

fn make_batch(client: &str, sequence: u64, samples: &[(&str, MetricKind, f64, DateTime<Utc>)]) -> Batch {
    Batch {
        sequence,
        client: ClientIdentity::new(client),
        samples: samples
            .iter()
            .enumerate()
            .map(|(i, (subject, metric, value, wall))| Sample {
                subject: subject.to_string(),
                metric: *metric,
                value: *value,
                timestamp: CaptureInstant {
                    wall: *wall,
                    monotonic_ns: i as u64,
                },
            })
            .collect(),
    }
}

fn query_all(client: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> SampleQuery {
    SampleQuery {
        client: client.to_string(),
        subject: None,
        metric: None,
        from,
        to,
    }
}

#[tokio::test]
async fn sqlite_append_and_query() {
    let (_dir, sink) = setup();
    let now = now_secs();
    let batch = make_batch(
        "svc",
        1,
        &[
            ("svc", MetricKind::CpuTime, 12.5, now - Duration::seconds(5)),
            ("svc", MetricKind::ThreadCount, 7.0, now - Duration::seconds(5)),
            ("host", MetricKind::WorkingSetBytes, 1e9, now),
        ],
    );
    sink.append(&batch).await.unwrap();

    let results = sink
        .query(&query_all("svc", now - Duration::minutes(1), now + Duration::seconds(1)))
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[0].captured_at <= results[2].captured_at);
    assert!(results.iter().all(|s| s.sequence == 1 && s.client == "svc"));
    assert_eq!(results[0].metric, MetricKind::CpuTime);
    assert_eq!(results[0].value, 12.5);
    assert_eq!(results[0].captured_at, now - Duration::seconds(5));
    assert!(results[0].id.parse::<i64>().is_ok());
}

#[tokio::test]
async fn sqlite_query_filters_subject_and_metric() {
    let (_dir, sink) = setup();
    let now = now_secs();
    let batch = make_batch(
        "svc",
        3,
        &[
            ("svc", MetricKind::CpuTime, 1.0, now),
            ("svc", MetricKind::ThreadCount, 2.0, now),
            ("db", MetricKind::CpuTime, 3.0, now),
        ],
    );
    sink.append(&batch).await.unwrap();
    sink.append(&make_batch("other", 1, &[("svc", MetricKind::CpuTime, 9.0, now)]))
        .await
        .unwrap();

    let mut query = query_all("svc", now - Duration::minutes(1), now + Duration::seconds(1));
    query.subject = Some("svc".into());
    query.metric = Some(MetricKind::CpuTime);
    let results = sink.query(&query).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value, 1.0);
}

#[tokio::test]
async fn sqlite_query_empty_result() {
    let (_dir, sink) = setup();
    let now = Utc::now();
    let results = sink
        .query(&query_all("nonexistent", now - Duration::hours(1), now))
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn sqlite_batch_lands_in_partition_of_earliest_capture() {
    let (_dir, sink) = setup();
    let yesterday_late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap();
    let today_early = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap();
    let batch = make_batch(
        "svc",
        1,
        &[
            ("svc", MetricKind::CpuTime, 1.0, today_early),
            ("svc", MetricKind::CpuTime, 2.0, yesterday_late),
        ],
    );
    sink.append(&batch).await.unwrap();

    let partitions = sink.list_partitions().unwrap();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].date, "2024-03-01");
}

#[tokio::test]
async fn sqlite_empty_batch_creates_no_partition() {
    let (_dir, sink) = setup();
    sink.append(&make_batch("svc", 1, &[])).await.unwrap();
    assert!(sink.list_partitions().unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_retention_cleanup() {
    let (_dir, sink) = setup();
    let now = now_secs();
    sink.append(&make_batch(
        "svc",
        1,
        &[("svc", MetricKind::CpuTime, 1.0, now - Duration::days(10))],
    ))
    .await
    .unwrap();
    sink.append(&make_batch("svc", 2, &[("svc", MetricKind::CpuTime, 2.0, now)]))
        .await
        .unwrap();

    assert_eq!(sink.cleanup(7).await.unwrap(), 1);
    let remaining = sink
        .query(&query_all("svc", now - Duration::days(30), now + Duration::seconds(1)))
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].sequence, 2);
}

#[tokio::test]
async fn sqlite_concurrent_appends_are_all_stored() {
    let (_dir, sink) = setup();
    let sink = Arc::new(sink);
    let now = now_secs();
    let mut handles = Vec::new();
    for client in 0..4 {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("client-{client}");
            for seq in 1..=5 {
                let batch = make_batch(&name, seq, &[("host", MetricKind::CpuTime, seq as f64, now)]);
                sink.append(&batch).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for client in 0..4 {
        let stored = sink
            .query(&query_all(
                &format!("client-{client}"),
                now - Duration::minutes(1),
                now + Duration::seconds(1),
            ))
            .unwrap();
        assert_eq!(stored.len(), 5);
    }
}

#[tokio::test]
async fn jsonl_writes_one_line_per_sample_in_daily_files() {
    let dir = TempDir::new().unwrap();
    let sink = JsonLinesSink::new(dir.path()).unwrap();
    let day1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let day2 = Utc.with_ymd_and_hms(2024, 5, 2, 1, 0, 0).unwrap();
    sink.append(&make_batch(
        "svc",
        4,
        &[
            ("svc", MetricKind::CpuTime, 12.5, day1),
            ("svc", MetricKind::ThreadCount, 7.0, day1),
            ("host", MetricKind::ElapsedTime, 3600.0, day2),
        ],
    ))
    .await
    .unwrap();

    let first = std::fs::read_to_string(sink.file_for(day1.date_naive())).unwrap();
    let lines: Vec<serde_json::Value> = first
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["client"], "svc");
    assert_eq!(lines[0]["sequence"], 4);
    assert_eq!(lines[0]["metric"], "cpu_time");
    assert_eq!(lines[0]["value"], 12.5);
    assert_eq!(lines[1]["metric"], "thread_count");

    let second = std::fs::read_to_string(sink.file_for(day2.date_naive())).unwrap();
    assert_eq!(second.lines().count(), 1);
    assert!(dir.path().join("samples-2024-05-02.ndjson").exists());
}

#[tokio::test]
async fn jsonl_cleanup_removes_old_files_only() {
    let dir = TempDir::new().unwrap();
    let sink = JsonLinesSink::new(dir.path()).unwrap();
    let now = now_secs();
    sink.append(&make_batch(
        "svc",
        1,
        &[
            ("svc", MetricKind::CpuTime, 1.0, now - Duration::days(20)),
            ("svc", MetricKind::CpuTime, 2.0, now),
        ],
    ))
    .await
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

    assert_eq!(sink.cleanup(7).await.unwrap(), 1);
    assert!(sink.file_for(now.date_naive()).exists());
    assert!(dir.path().join("notes.txt").exists());
}

#[tokio::test]
async fn memory_sink_injected_failures() {
    let sink = MemorySink::new();
    let batch = make_batch("svc", 1, &[("svc", MetricKind::CpuTime, 1.0, Utc::now())]);

    sink.fail_next(2);
    assert!(matches!(sink.append(&batch).await, Err(SinkError::Unavailable(_))));
    assert!(sink.append(&batch).await.is_err());
    sink.append(&batch).await.unwrap();
    assert_eq!(sink.attempts(), 3);
    assert_eq!(sink.batches().len(), 1);

    sink.set_fail_always(true);
    assert!(sink.append(&batch).await.is_err());
    assert_eq!(sink.batches().len(), 1);
    assert_eq!(sink.cleanup(1).await.unwrap(), 0);
}
