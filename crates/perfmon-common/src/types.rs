use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Performance counter kinds collected for every subject.
///
/// # Examples
///
/// ```
/// use perfmon_common::types::MetricKind;
///
/// let kind: MetricKind = "thread_count".parse().unwrap();
/// assert_eq!(kind, MetricKind::ThreadCount);
/// assert_eq!(kind.to_string(), "thread_count");
/// assert_eq!(MetricKind::from_code(kind.code()), Some(kind));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Accumulated CPU time, in seconds.
    CpuTime,
    /// Wall time since the subject started, in seconds.
    ElapsedTime,
    IoReadBytesPerSec,
    IoWriteBytesPerSec,
    ThreadCount,
    WorkingSetBytes,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::CpuTime,
        MetricKind::ElapsedTime,
        MetricKind::IoReadBytesPerSec,
        MetricKind::IoWriteBytesPerSec,
        MetricKind::ThreadCount,
        MetricKind::WorkingSetBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuTime => "cpu_time",
            MetricKind::ElapsedTime => "elapsed_time",
            MetricKind::IoReadBytesPerSec => "io_read_bytes_per_sec",
            MetricKind::IoWriteBytesPerSec => "io_write_bytes_per_sec",
            MetricKind::ThreadCount => "thread_count",
            MetricKind::WorkingSetBytes => "working_set_bytes",
        }
    }

    /// Stable one-byte tag used on the wire.
    pub fn code(&self) -> u8 {
        match self {
            MetricKind::CpuTime => 1,
            MetricKind::ElapsedTime => 2,
            MetricKind::IoReadBytesPerSec => 3,
            MetricKind::IoWriteBytesPerSec => 4,
            MetricKind::ThreadCount => 5,
            MetricKind::WorkingSetBytes => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown metric kind: {s}"))
    }
}

/// Something the sampler can read counters for.
///
/// # Examples
///
/// ```
/// use perfmon_common::types::Subject;
///
/// assert_eq!("host".parse::<Subject>().unwrap(), Subject::Host);
/// assert_eq!("pid:42".parse::<Subject>().unwrap(), Subject::Pid(42));
/// assert_eq!("nginx".parse::<Subject>().unwrap(), Subject::Process("nginx".into()));
/// assert_eq!(Subject::Pid(42).to_string(), "pid:42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Subject {
    Host,
    /// All running processes with this exact executable name.
    Process(String),
    Pid(u32),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Host => f.write_str("host"),
            Subject::Process(name) => f.write_str(name),
            Subject::Pid(pid) => write!(f, "pid:{pid}"),
        }
    }
}

impl FromStr for Subject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("subject cannot be empty".to_string());
        }
        if s.eq_ignore_ascii_case("host") {
            return Ok(Subject::Host);
        }
        if let Some(pid) = s.strip_prefix("pid:") {
            return pid
                .parse()
                .map(Subject::Pid)
                .map_err(|_| format!("invalid pid in subject: {s}"));
        }
        Ok(Subject::Process(s.to_string()))
    }
}

impl TryFrom<String> for Subject {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.to_string()
    }
}

/// Client identity taken from the certificate subject of the TLS peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capture instant: wall clock for attribution plus a monotonic offset for
/// ordering samples taken by the same sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaptureInstant {
    pub wall: DateTime<Utc>,
    /// Nanoseconds since the sampler's epoch.
    pub monotonic_ns: u64,
}

impl CaptureInstant {
    pub fn now_since(epoch: Instant) -> Self {
        let monotonic_ns = u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Self {
            wall: Utc::now(),
            monotonic_ns,
        }
    }
}

/// One observation. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub subject: String,
    pub metric: MetricKind,
    pub value: f64,
    pub timestamp: CaptureInstant,
}

/// Ordered group of samples shipped as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub sequence: u64,
    pub client: ClientIdentity,
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Earliest wall-clock capture time in the batch, if any.
    pub fn earliest_capture(&self) -> Option<DateTime<Utc>> {
        self.samples.iter().map(|s| s.timestamp.wall).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_codes_are_unique_and_reversible() {
        for kind in MetricKind::ALL {
            assert_eq!(MetricKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MetricKind::from_code(0), None);
        assert_eq!(MetricKind::from_code(7), None);
    }

    #[test]
    fn metric_kind_parse_is_case_insensitive() {
        assert_eq!("CPU_TIME".parse::<MetricKind>(), Ok(MetricKind::CpuTime));
        assert!("cpu.usage".parse::<MetricKind>().is_err());
    }

    #[test]
    fn subject_rejects_bad_pid_and_empty() {
        assert!("pid:abc".parse::<Subject>().is_err());
        assert!("  ".parse::<Subject>().is_err());
        assert_eq!("HOST".parse::<Subject>(), Ok(Subject::Host));
    }

    #[test]
    fn earliest_capture_picks_minimum() {
        let early = Utc::now() - chrono::Duration::seconds(30);
        let late = Utc::now();
        let sample = |wall| Sample {
            subject: "svc".into(),
            metric: MetricKind::CpuTime,
            value: 1.0,
            timestamp: CaptureInstant {
                wall,
                monotonic_ns: 0,
            },
        };
        let batch = Batch {
            sequence: 1,
            client: ClientIdentity::new("svc"),
            samples: vec![sample(late), sample(early)],
        };
        assert_eq!(batch.earliest_capture(), Some(early));
        assert_eq!(batch.len(), 2);
    }
}
