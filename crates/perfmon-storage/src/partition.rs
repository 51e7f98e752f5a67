use crate::error::{Result, SinkError};
use crate::PartitionInfo;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SAMPLES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    id TEXT PRIMARY KEY,
    client TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    subject TEXT NOT NULL,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    captured_at INTEGER NOT NULL,
    monotonic_ns INTEGER NOT NULL,
    received_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_samples_client_subject_time
    ON samples(client, subject, captured_at);
CREATE INDEX IF NOT EXISTS idx_samples_time
    ON samples(captured_at);
";

/// Daily SQLite databases named `YYYY-MM-DD.db` under one directory, with
/// their connections cached for the life of the manager.
pub struct PartitionManager {
    data_dir: PathBuf,
    connections: Mutex<HashMap<String, Connection>>,
}

impl PartitionManager {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Lock the connections map, recovering from a poisoned Mutex if necessary.
    fn lock_connections(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn partition_key(ts: DateTime<Utc>) -> String {
        ts.format("%Y-%m-%d").to_string()
    }

    fn partition_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.db"))
    }

    fn open(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SAMPLES_SCHEMA)?;
        Ok(conn)
    }

    pub fn get_or_create(&self, ts: DateTime<Utc>) -> Result<String> {
        let key = Self::partition_key(ts);
        let mut conns = self.lock_connections();
        if !conns.contains_key(&key) {
            let path = self.partition_path(&key);
            let existed = path.exists();
            let conn = Self::open(&path)?;
            if !existed {
                tracing::info!(partition = %key, "Created new partition");
            }
            conns.insert(key.clone(), conn);
        }
        Ok(key)
    }

    pub fn with_partition<F, R>(&self, key: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conns = self.lock_connections();
        let conn = conns
            .get(key)
            .ok_or_else(|| SinkError::PartitionNotFound(key.to_string()))?;
        f(conn)
    }

    /// Keys of the partitions on disk that cover `from..=to`, opening any not
    /// yet cached.
    pub fn partitions_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut date = from.date_naive();
        let to_date = to.date_naive();
        while date <= to_date {
            let key = date.format("%Y-%m-%d").to_string();
            let path = self.partition_path(&key);
            if path.exists() {
                let mut conns = self.lock_connections();
                if !conns.contains_key(&key) {
                    conns.insert(key.clone(), Self::open(&path)?);
                }
                keys.push(key);
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(keys)
    }

    /// Deletes partitions dated strictly before `today - retention_days`,
    /// together with their WAL and SHM files. Failures to remove a single
    /// partition are logged and skipped.
    pub fn cleanup_older_than(&self, retention_days: u32) -> Result<u32> {
        let cutoff_date = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
        let mut removed = 0u32;

        for (date_str, db_path) in self.dated_files()? {
            let Ok(date) = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d") else {
                continue;
            };
            if date >= cutoff_date {
                continue;
            }

            // Dropping the cached connection checkpoints the WAL.
            self.lock_connections().remove(date_str.as_str());

            if let Err(e) = std::fs::remove_file(&db_path) {
                tracing::error!(partition = %date_str, error = %e, "Failed to remove partition file");
                continue;
            }
            for suffix in ["db-wal", "db-shm"] {
                let aux = self.data_dir.join(format!("{date_str}.{suffix}"));
                if aux.exists() {
                    if let Err(e) = std::fs::remove_file(&aux) {
                        tracing::warn!(path = %aux.display(), error = %e, "Failed to remove auxiliary file");
                    }
                }
            }

            tracing::info!(partition = %date_str, "Removed expired partition");
            removed += 1;
        }

        Ok(removed)
    }

    /// Returns information about all existing partitions on disk.
    pub fn list_partition_info(&self) -> Result<Vec<PartitionInfo>> {
        let mut infos = Vec::new();
        for (date_str, path) in self.dated_files()? {
            if NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").is_err() {
                continue;
            }
            let metadata = std::fs::metadata(&path)?;
            infos.push(PartitionInfo {
                date: date_str,
                size_bytes: metadata.len(),
                path: path.to_string_lossy().to_string(),
            });
        }
        infos.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(infos)
    }

    fn dated_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(date_str) = name.strip_suffix(".db") {
                files.push((date_str.to_string(), entry.path()));
            }
        }
        Ok(files)
    }
}
