use crate::{CounterError, CounterSource};
use perfmon_common::types::{Batch, CaptureInstant, ClientIdentity, MetricKind, Sample, Subject};
use std::collections::BTreeSet;
use std::time::Instant;

/// Turns counter readings into sequenced batches.
///
/// Sequence numbers start at 1 and increase by one for every batch this
/// sampler produces, for the lifetime of the sampler.
pub struct MetricSampler<C> {
    source: C,
    client: ClientIdentity,
    metrics: Vec<MetricKind>,
    epoch: Instant,
    next_sequence: u64,
}

impl<C: CounterSource> MetricSampler<C> {
    pub fn new(source: C, client: ClientIdentity, metrics: Vec<MetricKind>) -> Self {
        let metrics = if metrics.is_empty() {
            MetricKind::ALL.to_vec()
        } else {
            metrics
        };
        Self {
            source,
            client,
            metrics,
            epoch: Instant::now(),
            next_sequence: 1,
        }
    }

    pub fn client(&self) -> &ClientIdentity {
        &self.client
    }

    /// Reads every configured metric for the host and each subject.
    ///
    /// Subjects that have exited are skipped; the call still succeeds with
    /// the remaining readings.
    ///
    /// # Errors
    ///
    /// Fails only when host counters cannot be read.
    pub fn sample(&mut self, subjects: &BTreeSet<Subject>) -> Result<Batch, CounterError> {
        let samples = self.read_pass(subjects)?;
        Ok(self.seal(samples))
    }

    /// Like [`sample`](Self::sample), but splits the readings into batches of
    /// at most `max_batch_size` samples. An empty pass yields no batches.
    pub fn sample_batches(
        &mut self,
        subjects: &BTreeSet<Subject>,
        max_batch_size: usize,
    ) -> Result<Vec<Batch>, CounterError> {
        let samples = self.read_pass(subjects)?;
        let max = max_batch_size.max(1);
        let mut batches = Vec::with_capacity(samples.len().div_ceil(max));
        for chunk in samples.chunks(max) {
            batches.push(self.seal(chunk.to_vec()));
        }
        Ok(batches)
    }

    fn seal(&mut self, samples: Vec<Sample>) -> Batch {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Batch {
            sequence,
            client: self.client.clone(),
            samples,
        }
    }

    fn read_pass(&mut self, subjects: &BTreeSet<Subject>) -> Result<Vec<Sample>, CounterError> {
        self.source
            .refresh()
            .map_err(|e| CounterError::Unavailable(format!("refresh failed: {e}")))?;
        let captured = CaptureInstant::now_since(self.epoch);
        let mut samples = Vec::new();

        match self.read_subject(&Subject::Host, captured) {
            Ok(readings) => samples.extend(readings),
            Err(e) => {
                return Err(CounterError::Unavailable(format!("host: {e}")));
            }
        }

        for subject in subjects.iter().filter(|s| **s != Subject::Host) {
            match self.read_subject(subject, captured) {
                Ok(readings) => samples.extend(readings),
                Err(CounterError::SubjectGone(_)) => {
                    tracing::debug!(subject = %subject, "Subject not running, skipped");
                }
                Err(e) => {
                    tracing::warn!(subject = %subject, error = %e, "Failed to read subject, skipped");
                }
            }
        }

        Ok(samples)
    }

    /// All-or-nothing per subject so a process that exits halfway through a
    /// pass does not leave a partial set of metrics behind.
    fn read_subject(
        &self,
        subject: &Subject,
        captured: CaptureInstant,
    ) -> Result<Vec<Sample>, CounterError> {
        let name = subject.to_string();
        let mut readings = Vec::with_capacity(self.metrics.len());
        for &metric in &self.metrics {
            let Some(value) = self.source.read(subject, metric)? else {
                continue;
            };
            if !value.is_finite() {
                tracing::warn!(subject = %name, metric = %metric, "Non-finite counter value dropped");
                continue;
            }
            readings.push(Sample {
                subject: name.clone(),
                metric,
                value,
                timestamp: captured,
            });
        }
        Ok(readings)
    }
}
