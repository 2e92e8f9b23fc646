//! Metadata key/value storage + conditional HTTP change detection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cdl_core::{civic_timestamp, SqlIdent};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdl-storage";

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Minimal persistent string map.
///
/// Absence is a real state: callers that want "no value" should go through
/// [`KvStore::set_or_delete`] instead of storing an empty string.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Fails with [`KvError::NotFound`] if the key is absent.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn contains(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set_or_delete(&self, key: &str, value: Option<&str>) -> Result<(), KvError> {
        match value {
            Some(value) => self.set(key, value).await,
            None if self.contains(key).await? => self.delete(key).await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }
}

/// [`KvStore`] over a `(key TEXT PRIMARY KEY, value TEXT NOT NULL)` table.
///
/// Every call runs on its own pooled connection and commits on its own.
#[derive(Debug, Clone)]
pub struct PgKvStore {
    pool: PgPool,
    table: String,
}

impl PgKvStore {
    /// Creates the schema and backing table if they are missing.
    pub async fn open(pool: PgPool, schema: &SqlIdent, table: &SqlIdent) -> Result<Self, KvError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&pool)
            .await?;
        let table = format!("{schema}.{table}");
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)"
        ))
        .execute(&pool)
        .await?;
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let row = sqlx::query(&format!("SELECT value FROM {} WHERE key = $1", self.table))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            self.table
        ))
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = $1", self.table))
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(KvError::NotFound(key.to_string()));
        }
        Ok(())
    }
}

/// HTTP cache validators last seen for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LastmodInfo {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl LastmodInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn etag_key(url: &str) -> String {
        format!("etag:{url}")
    }

    pub fn last_modified_key(url: &str) -> String {
        format!("last_modified:{url}")
    }

    pub async fn read_from(url: &str, kv: &dyn KvStore) -> Result<Self, KvError> {
        Ok(Self {
            url: url.to_string(),
            etag: kv.get(&Self::etag_key(url)).await?,
            last_modified: kv.get(&Self::last_modified_key(url)).await?,
        })
    }

    /// Missing validators delete whatever was stored before.
    pub async fn write_to(&self, kv: &dyn KvStore) -> Result<(), KvError> {
        kv.set_or_delete(
            &Self::last_modified_key(&self.url),
            self.last_modified.as_deref(),
        )
        .await?;
        kv.set_or_delete(&Self::etag_key(&self.url), self.etag.as_deref())
            .await
    }

    pub fn from_response_headers(url: &str, headers: &HeaderMap) -> Self {
        let read = |name| {
            headers
                .get(name)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            url: url.to_string(),
            etag: read(ETAG),
            last_modified: read(LAST_MODIFIED),
        }
    }

    pub fn to_request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            (IF_NONE_MATCH, self.etag.as_deref()),
            (IF_MODIFIED_SINCE, self.last_modified.as_deref()),
        ] {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(_) => warn!(url = %self.url, header = %name, "stored validator is not a valid header value; omitting"),
            }
        }
        headers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` leaves the transport default in place.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Outcome of one conditional GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlProbe {
    NotModified,
    /// Carries the validators the server sent with the fresh response.
    Modified(LastmodInfo),
}

#[async_trait]
pub trait ConditionalFetcher: Send + Sync {
    async fn probe(&self, previous: &LastmodInfo) -> Result<UrlProbe, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl ConditionalFetcher for HttpFetcher {
    /// Streams the response without reading the body; only status and headers matter.
    async fn probe(&self, previous: &LastmodInfo) -> Result<UrlProbe, FetchError> {
        let url = previous.url.as_str();
        let headers = previous.to_request_headers();

        for attempt in 0..=self.backoff.max_retries {
            let err = match self.client.get(url).headers(headers.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match status {
                        StatusCode::NOT_MODIFIED => return Ok(UrlProbe::NotModified),
                        StatusCode::OK => {
                            let fresh = LastmodInfo::from_response_headers(url, resp.headers());
                            return Ok(UrlProbe::Modified(fresh));
                        }
                        _ => {}
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt == self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    debug!(url, %status, attempt, "retrying conditional GET");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                || attempt == self.backoff.max_retries
            {
                return Err(FetchError::Request(err));
            }
            debug!(url, error = %err, attempt, "retrying conditional GET");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
        }

        unreachable!("the final attempt always returns")
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] KvError),
}

/// Decides whether a dataset's upstream files changed since they were last fetched.
///
/// Fresh validators are buffered by [`UrlChangeDetector::has_any_url_changed`] and only
/// persisted by [`UrlChangeDetector::commit`], so a failed import leaves the old
/// validators in place and the next run retries.
pub struct UrlChangeDetector {
    urls: Vec<String>,
    kv: Arc<dyn KvStore>,
    fetcher: Arc<dyn ConditionalFetcher>,
    pending: Vec<LastmodInfo>,
}

impl UrlChangeDetector {
    pub fn new(urls: Vec<String>, kv: Arc<dyn KvStore>, fetcher: Arc<dyn ConditionalFetcher>) -> Self {
        Self {
            urls,
            kv,
            fetcher,
            pending: Vec::new(),
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn pending(&self) -> &[LastmodInfo] {
        &self.pending
    }

    /// A dataset with no tracked URLs always counts as changed.
    pub async fn has_any_url_changed(&mut self) -> Result<bool, DetectError> {
        self.pending.clear();
        if self.urls.is_empty() {
            return Ok(true);
        }

        let run_id = Uuid::new_v4();
        for url in &self.urls {
            let previous = LastmodInfo::read_from(url, self.kv.as_ref()).await?;
            let span = info_span!("url_probe", %run_id, url = %url);
            match self.fetcher.probe(&previous).instrument(span).await? {
                UrlProbe::NotModified => debug!(url = %url, "upstream not modified"),
                UrlProbe::Modified(fresh) => {
                    info!(url = %url, etag = ?fresh.etag, last_modified = ?fresh.last_modified, "upstream changed");
                    self.pending.push(fresh);
                }
            }
        }
        Ok(!self.pending.is_empty())
    }

    pub async fn commit(&self) -> Result<(), KvError> {
        for info in &self.pending {
            info.write_to(self.kv.as_ref()).await?;
        }
        Ok(())
    }
}

/// Records when a dataset last finished a successful build.
pub struct DatasetTracker {
    dataset: String,
    kv: Arc<dyn KvStore>,
}

impl DatasetTracker {
    pub fn new(dataset: impl Into<String>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            dataset: dataset.into(),
            kv,
        }
    }

    pub async fn record_build_completed(&self) -> Result<(), KvError> {
        self.record_build_completed_at(Utc::now()).await
    }

    pub async fn record_build_completed_at(&self, at: DateTime<Utc>) -> Result<(), KvError> {
        self.kv
            .set_or_delete(&self.dataset, Some(&civic_timestamp(at)))
            .await
    }

    pub async fn last_build(&self) -> Result<Option<String>, KvError> {
        self.kv.get(&self.dataset).await
    }
}
