//! Samples-per-second accounting over a sliding one-second window.
//!
//! Two rates are tracked: how many samples the server received in the last
//! second, and how many of the received samples were captured in the last
//! second. The second one drops behind the first when clients deliver a
//! backlog after an outage.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use perfmon_common::types::Batch;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Default)]
struct Window {
    total: u64,
    entries: VecDeque<(DateTime<Utc>, u64)>,
}

impl Window {
    fn push(&mut self, at: DateTime<Utc>, count: u64) {
        self.total += count;
        self.entries.push_back((at, count));
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(1);
        let mut expired = 0;
        self.entries.retain(|(at, count)| {
            let keep = *at >= cutoff;
            if !keep {
                expired += count;
            }
            keep
        });
        self.total -= expired;
    }
}

#[derive(Debug, Default)]
pub struct ThroughputWindow {
    received: Window,
    captured: Window,
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, batch: &Batch, now: DateTime<Utc>) {
        let mut by_second: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
        for sample in &batch.samples {
            *by_second
                .entry(sample.timestamp.wall.trunc_subsecs(0))
                .or_insert(0) += 1;
        }
        for (second, count) in by_second {
            self.captured.push(second, count);
        }
        self.received.push(now, batch.len() as u64);
        self.expire(now);
    }

    /// `(received, captured)` samples per second as of `now`.
    pub fn rates(&mut self, now: DateTime<Utc>) -> (u64, u64) {
        self.expire(now);
        (self.received.total, self.captured.total)
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        self.received.expire(now);
        self.captured.expire(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use perfmon_common::types::{CaptureInstant, ClientIdentity, MetricKind, Sample};

    fn batch(captured: &[DateTime<Utc>]) -> Batch {
        Batch {
            sequence: 1,
            client: ClientIdentity::new("svc"),
            samples: captured
                .iter()
                .map(|wall| Sample {
                    subject: "svc".into(),
                    metric: MetricKind::CpuTime,
                    value: 1.0,
                    timestamp: CaptureInstant {
                        wall: *wall,
                        monotonic_ns: 0,
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn rates_cover_the_last_second_only() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut window = ThroughputWindow::new();

        window.record(&batch(&[t0, t0]), t0);
        window.record(&batch(&[t0]), t0 + Duration::milliseconds(500));
        assert_eq!(window.rates(t0 + Duration::milliseconds(900)), (3, 3));

        let later = t0 + Duration::milliseconds(1200);
        assert_eq!(window.rates(later), (1, 0));
        assert_eq!(window.rates(t0 + Duration::seconds(3)), (0, 0));
    }

    #[test]
    fn late_backlog_counts_as_received_only() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let stale = now - Duration::minutes(5);
        let mut window = ThroughputWindow::new();

        window.record(&batch(&[stale, stale, now]), now);
        assert_eq!(window.rates(now), (3, 1));
    }
}
