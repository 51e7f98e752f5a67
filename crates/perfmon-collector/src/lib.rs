//! Counter sampling for the perfmon client.
//!
//! A [`CounterSource`] is the platform-specific capability that knows how to
//! read a single counter for a single subject. [`sampler::MetricSampler`] drives
//! it once per sampling interval and turns the readings into sequenced
//! [`perfmon_common::types::Batch`]es.

pub mod sampler;
pub mod system;

use perfmon_common::types::{MetricKind, Subject};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CounterError {
    /// The subject exited (or never existed) since the last refresh.
    #[error("subject {0} is not running")]
    SubjectGone(String),

    /// Counters could not be read at all.
    #[error("counters unavailable: {0}")]
    Unavailable(String),
}

/// Source of raw performance counter values.
///
/// The sampler calls [`refresh`](CounterSource::refresh) once at the start of
/// every pass and then [`read`](CounterSource::read) for each
/// (subject, metric) pair, so implementations can snapshot OS state once and
/// answer reads from the snapshot.
pub trait CounterSource: Send {
    /// Takes a fresh snapshot of the counters.
    ///
    /// # Errors
    ///
    /// Returns [`CounterError::Unavailable`] if the OS counters cannot be read.
    fn refresh(&mut self) -> Result<(), CounterError>;

    /// Reads one counter. `Ok(None)` means the metric is not meaningful for
    /// this subject and is skipped.
    fn read(&self, subject: &Subject, metric: MetricKind) -> Result<Option<f64>, CounterError>;
}
