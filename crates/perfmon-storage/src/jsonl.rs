use crate::error::Result;
use crate::{SampleRecord, Sink};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use perfmon_common::types::Batch;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const FILE_PREFIX: &str = "samples-";
const FILE_SUFFIX: &str = ".ndjson";

/// Appends samples to `samples-YYYY-MM-DD.ndjson`, one file per UTC day of
/// capture.
pub struct JsonLinesSink {
    dir: PathBuf,
    // Serialises appends so lines from concurrent connections never interleave.
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn file_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", day.format("%Y-%m-%d")))
    }

    fn render(batch: &Batch, received_at: DateTime<Utc>) -> Result<BTreeMap<NaiveDate, Vec<u8>>> {
        let mut by_day: BTreeMap<NaiveDate, Vec<u8>> = BTreeMap::new();
        for record in SampleRecord::from_batch(batch, received_at) {
            let buf = by_day.entry(record.captured_at.date_naive()).or_default();
            serde_json::to_writer(&mut *buf, &record)?;
            buf.push(b'\n');
        }
        Ok(by_day)
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, batch: &Batch) -> Result<()> {
        let rendered = Self::render(batch, Utc::now())?;
        let _guard = self.write_lock.lock().await;
        for (day, lines) in rendered {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_for(day))
                .await?;
            file.write_all(&lines).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u32> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
        let _guard = self.write_lock.lock().await;
        let mut removed = 0u32;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date_str) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                continue;
            };
            if date >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    tracing::info!(file = %name, "Removed expired sample file");
                    removed += 1;
                }
                Err(e) => tracing::error!(file = %name, error = %e, "Failed to remove sample file"),
            }
        }
        Ok(removed)
    }
}
