use crate::{CounterError, CounterSource};
use perfmon_common::types::{MetricKind, Subject};
use std::time::Instant;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System};

/// Counters read from the local OS through `sysinfo`.
pub struct SystemCounters {
    system: System,
    last_refresh: Option<Instant>,
    /// Wall seconds covered by the latest refresh; `None` before the second one.
    interval_secs: Option<f64>,
}

#[derive(Default)]
struct Totals {
    cpu_ms: u64,
    run_time_secs: u64,
    read_bytes: u64,
    written_bytes: u64,
    threads: Option<u64>,
    memory_bytes: u64,
}

impl Totals {
    fn add(&mut self, process: &Process) {
        let disk = process.disk_usage();
        self.cpu_ms += process.accumulated_cpu_time();
        self.run_time_secs = self.run_time_secs.max(process.run_time());
        self.read_bytes += disk.read_bytes;
        self.written_bytes += disk.written_bytes;
        self.memory_bytes += process.memory();
        if let Some(tasks) = process.tasks() {
            *self.threads.get_or_insert(0) += tasks.len().max(1) as u64;
        }
    }
}

impl SystemCounters {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            last_refresh: None,
            interval_secs: None,
        }
    }

    /// Processes backing `subject`. Thread entries are skipped; their
    /// counters are already part of the owning process.
    fn matching(&self, subject: &Subject) -> Vec<&Process> {
        let processes = self
            .system
            .processes()
            .values()
            .filter(|p| p.thread_kind().is_none());
        match subject {
            Subject::Host => processes.collect(),
            Subject::Pid(pid) => self
                .system
                .process(Pid::from_u32(*pid))
                .into_iter()
                .collect(),
            Subject::Process(name) => processes
                .filter(|p| p.name() == name.as_str())
                .collect(),
        }
    }

    fn rate(&self, bytes: u64) -> f64 {
        match self.interval_secs {
            Some(secs) if secs > 0.0 => bytes as f64 / secs,
            _ => 0.0,
        }
    }
}

impl Default for SystemCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SystemCounters {
    fn refresh(&mut self) -> Result<(), CounterError> {
        let now = Instant::now();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_memory()
                .with_disk_usage()
                .with_tasks(),
        );
        self.system.refresh_memory();
        self.interval_secs = self
            .last_refresh
            .map(|previous| now.duration_since(previous).as_secs_f64());
        self.last_refresh = Some(now);

        if self.system.processes().is_empty() {
            return Err(CounterError::Unavailable(
                "process table is empty".to_string(),
            ));
        }
        Ok(())
    }

    fn read(&self, subject: &Subject, metric: MetricKind) -> Result<Option<f64>, CounterError> {
        if self.last_refresh.is_none() {
            return Err(CounterError::Unavailable("counters not refreshed".to_string()));
        }
        let processes = self.matching(subject);
        if processes.is_empty() {
            return match subject {
                Subject::Host => Err(CounterError::Unavailable(
                    "process table is empty".to_string(),
                )),
                other => Err(CounterError::SubjectGone(other.to_string())),
            };
        }

        let mut totals = Totals::default();
        for process in processes {
            totals.add(process);
        }
        if *subject == Subject::Host {
            totals.run_time_secs = System::uptime();
            totals.memory_bytes = self.system.used_memory();
        }

        let value = match metric {
            MetricKind::CpuTime => Some(totals.cpu_ms as f64 / 1000.0),
            MetricKind::ElapsedTime => Some(totals.run_time_secs as f64),
            MetricKind::IoReadBytesPerSec => Some(self.rate(totals.read_bytes)),
            MetricKind::IoWriteBytesPerSec => Some(self.rate(totals.written_bytes)),
            // Only some platforms expose per-process threads.
            MetricKind::ThreadCount => totals.threads.map(|n| n as f64),
            MetricKind::WorkingSetBytes => Some(totals.memory_bytes as f64),
        };
        Ok(value)
    }
}
