use crate::error::{Result, SinkError};
use crate::{SampleRecord, Sink};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use perfmon_common::types::Batch;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const INDEX_DATE_FORMAT: &str = "%Y.%m.%d";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Deserialize)]
pub struct ElasticConfig {
    /// Base URL of the cluster, e.g. `https://search.internal:9200`.
    #[serde(default = "default_url")]
    pub url: String,
    /// Daily indices are named `<index_prefix>-YYYY.MM.DD`.
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_url() -> String {
    "http://127.0.0.1:9200".to_string()
}

fn default_index_prefix() -> String {
    "perfmon-samples".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            index_prefix: default_index_prefix(),
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CatIndex {
    index: String,
}

/// Indexes samples into daily Elasticsearch indices through the `_bulk` API.
///
/// Every sample gets a document id derived from its client, subject, metric
/// and capture instant, and is written with a `create` action. Re-sending a
/// batch after a partial failure therefore only conflicts on the documents
/// that were already stored, and those conflicts count as success.
pub struct ElasticSink {
    http: reqwest::Client,
    base_url: String,
    index_prefix: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticSink {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            index_prefix: config.index_prefix.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn index_for(&self, day: NaiveDate) -> String {
        format!("{}-{}", self.index_prefix, day.format(INDEX_DATE_FORMAT))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/{}", self.base_url, path));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    fn bulk_body(&self, batch: &Batch, received_at: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for record in SampleRecord::from_batch(batch, received_at) {
            let id = format!(
                "{}:{}:{}:{}",
                record.client,
                record.subject,
                record.metric,
                record
                    .captured_at
                    .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
            );
            let action = serde_json::json!({
                "create": {
                    "_index": self.index_for(record.captured_at.date_naive()),
                    "_id": id,
                }
            });
            serde_json::to_writer(&mut body, &action)?;
            body.push(b'\n');
            serde_json::to_writer(&mut body, &record)?;
            body.push(b'\n');
        }
        Ok(body)
    }
}

async fn rejected(response: reqwest::Response, what: &str) -> SinkError {
    let status = response.status();
    let mut text = response.text().await.unwrap_or_default();
    if text.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    SinkError::Unavailable(format!("{what} returned {status}: {text}"))
}

#[async_trait]
impl Sink for ElasticSink {
    fn name(&self) -> &'static str {
        "elastic"
    }

    async fn append(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = self.bulk_body(batch, Utc::now())?;
        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response, "bulk request").await);
        }

        let result: BulkResponse = response.json().await?;
        if !result.errors {
            return Ok(());
        }
        let mut duplicates = 0usize;
        let mut failures = Vec::new();
        for item in result.items.iter().flat_map(|entry| entry.values()) {
            match (item.status, &item.error) {
                (409, _) => duplicates += 1,
                (_, Some(error)) => failures.push(error),
                _ => {}
            }
        }
        if let Some(first) = failures.first() {
            return Err(SinkError::Unavailable(format!(
                "{} of {} documents rejected, first: {first}",
                failures.len(),
                batch.len()
            )));
        }
        tracing::debug!(
            client = %batch.client,
            sequence = batch.sequence,
            duplicates,
            "Bulk request skipped already indexed samples"
        );
        Ok(())
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u32> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("_cat/indices/{}-*?format=json&h=index", self.index_prefix),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response, "index listing").await);
        }
        let indices: Vec<CatIndex> = response.json().await?;

        let prefix = format!("{}-", self.index_prefix);
        let mut removed = 0u32;
        for CatIndex { index } in indices {
            let Some(date) = index
                .strip_prefix(&prefix)
                .and_then(|rest| NaiveDate::parse_from_str(rest, INDEX_DATE_FORMAT).ok())
            else {
                continue;
            };
            if date >= cutoff {
                continue;
            }
            let response = self.request(reqwest::Method::DELETE, &index).send().await?;
            if response.status().is_success() {
                tracing::info!(index = %index, "Deleted expired index");
                removed += 1;
            } else {
                tracing::error!(index = %index, status = %response.status(), "Failed to delete index");
            }
        }
        Ok(removed)
    }
}
