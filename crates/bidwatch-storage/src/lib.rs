//! Durable record storage, concurrency governance, retry policy, and the
//! governed HTTP fetcher.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bidwatch_core::{CanonicalRecord, RawRecord};
use chrono::NaiveDate;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-storage";

const RAW_JOURNAL: &str = "raw.jsonl";
const CANONICAL_FILE: &str = "canonical.json";
const CHECKPOINT_FILE: &str = "checkpoints.json";
const PENDING_FILE: &str = "pending.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result of a content-hash-gated raw upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Unchanged,
    NewVersion,
}

#[derive(Debug, Clone, Default)]
pub struct RawQuery {
    pub source: Option<String>,
    pub limit: usize,
    pub skip: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalQuery {
    pub source: Option<String>,
    pub category: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: usize,
    pub skip: usize,
}

#[derive(Default)]
struct StoreState {
    // Arena of raw versions keyed by (source_name, source_id); versions
    // ascend, last entry is current. History is never rewritten.
    raw: BTreeMap<(String, String), Vec<RawRecord>>,
    canonical: BTreeMap<Uuid, CanonicalRecord>,
    checkpoints: BTreeMap<String, String>,
    pending: BTreeSet<(String, String)>,
}

/// File-backed store for raw versions, canonical records, per-source
/// checkpoints, and the pending set the pipeline drains.
///
/// Raw history lives in an append-only JSONL journal; the small mutable
/// files are replaced atomically via temp-file rename.
pub struct RecordStore {
    root: PathBuf,
    state: Mutex<StoreState>,
}

impl RecordStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut state = StoreState::default();

        let journal_path = root.join(RAW_JOURNAL);
        if fs::try_exists(&journal_path).await? {
            let text = fs::read_to_string(&journal_path).await?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawRecord>(line) {
                    Ok(record) => {
                        let key = (record.source_name.clone(), record.source_id.clone());
                        state.raw.entry(key).or_default().push(record);
                    }
                    // A torn trailing line from an interrupted append is
                    // recoverable; everything before it already replayed.
                    Err(err) => warn!(error = %err, "skipping unreadable raw journal line"),
                }
            }
        }

        if let Some(records) = read_json_if_present::<Vec<CanonicalRecord>>(
            &root.join(CANONICAL_FILE),
        )
        .await?
        {
            for record in records {
                state.canonical.insert(record.record_id, record);
            }
        }
        if let Some(checkpoints) =
            read_json_if_present::<BTreeMap<String, String>>(&root.join(CHECKPOINT_FILE)).await?
        {
            state.checkpoints = checkpoints;
        }
        if let Some(pending) =
            read_json_if_present::<BTreeSet<(String, String)>>(&root.join(PENDING_FILE)).await?
        {
            state.pending = pending;
        }

        info!(
            root = %root.display(),
            raw_items = state.raw.len(),
            canonical = state.canonical.len(),
            "record store opened"
        );
        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── raw records ──────────────────────────────────────────────────────

    /// Content-hash-gated upsert. Unchanged content writes nothing; changed
    /// content appends a new version, leaving prior versions addressable.
    pub async fn upsert_raw(&self, record: RawRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = (record.source_name.clone(), record.source_id.clone());

        if let Some(current) = state.raw.get(&key).and_then(|v| v.last()) {
            if current.content_hash == record.content_hash {
                debug!(source = %key.0, id = %key.1, "raw unchanged, skipping");
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let version = state
            .raw
            .get(&key)
            .and_then(|v| v.last())
            .map(|c| c.version + 1)
            .unwrap_or(1);
        let mut record = record;
        record.version = version;

        self.append_raw_line(&record).await?;
        state.raw.entry(key.clone()).or_default().push(record);
        state.pending.insert(key.clone());
        self.persist_pending(&state).await?;

        info!(source = %key.0, id = %key.1, version, "raw upserted");
        Ok(if version == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::NewVersion
        })
    }

    pub async fn current_raw(&self, source_name: &str, source_id: &str) -> Option<RawRecord> {
        let state = self.state.lock().await;
        state
            .raw
            .get(&(source_name.to_string(), source_id.to_string()))
            .and_then(|v| v.last())
            .cloned()
    }

    /// All stored versions for one item, oldest first.
    pub async fn raw_history(&self, source_name: &str, source_id: &str) -> Vec<RawRecord> {
        let state = self.state.lock().await;
        state
            .raw
            .get(&(source_name.to_string(), source_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Current raw versions, newest fetch first, with optional source filter.
    pub async fn list_raw(&self, query: &RawQuery) -> (usize, Vec<RawRecord>) {
        let state = self.state.lock().await;
        let mut rows: Vec<RawRecord> = state
            .raw
            .values()
            .filter_map(|versions| versions.last())
            .filter(|r| {
                query
                    .source
                    .as_deref()
                    .map(|s| r.source_name == s)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        let total = rows.len();
        let limit = if query.limit == 0 { total } else { query.limit };
        (total, rows.into_iter().skip(query.skip).take(limit).collect())
    }

    /// Current versions of every item marked dirty since the last pipeline
    /// drain. The pending set survives restarts; reprocessing is idempotent.
    pub async fn take_pending(&self) -> Vec<RawRecord> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .filter_map(|key| state.raw.get(key).and_then(|v| v.last()))
            .cloned()
            .collect()
    }

    pub async fn clear_pending(&self, keys: &[(String, String)]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.pending.remove(key);
        }
        self.persist_pending(&state).await
    }

    // ── canonical records ────────────────────────────────────────────────

    pub async fn upsert_canonical(&self, record: CanonicalRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        debug!(record_id = %record.record_id, "canonical upserted");
        state.canonical.insert(record.record_id, record);
        self.persist_canonical(&state).await
    }

    pub async fn get_canonical(&self, record_id: Uuid) -> Option<CanonicalRecord> {
        let state = self.state.lock().await;
        state.canonical.get(&record_id).cloned()
    }

    pub async fn canonical_by_provenance(
        &self,
        source_name: &str,
        source_id: &str,
    ) -> Option<CanonicalRecord> {
        let state = self.state.lock().await;
        state
            .canonical
            .values()
            .find(|c| {
                c.provenance
                    .iter()
                    .any(|p| p.source_name == source_name && p.source_id == source_id)
            })
            .cloned()
    }

    pub async fn all_canonical(&self) -> Vec<CanonicalRecord> {
        let state = self.state.lock().await;
        state.canonical.values().cloned().collect()
    }

    /// Filtered, paginated canonical listing; newest posted date first,
    /// undated records last.
    pub async fn list_canonical(&self, query: &CanonicalQuery) -> (usize, Vec<CanonicalRecord>) {
        let state = self.state.lock().await;
        let needle = query.search.as_deref().map(str::to_lowercase);
        let mut rows: Vec<CanonicalRecord> = state
            .canonical
            .values()
            .filter(|c| {
                query
                    .source
                    .as_deref()
                    .map(|s| c.provenance.iter().any(|p| p.source_name == s))
                    .unwrap_or(true)
            })
            .filter(|c| {
                query
                    .category
                    .as_deref()
                    .map(|cat| c.category.as_str() == cat)
                    .unwrap_or(true)
            })
            .filter(|c| {
                query
                    .status
                    .as_deref()
                    .map(|s| c.status.as_str() == s)
                    .unwrap_or(true)
            })
            .filter(|c| {
                needle
                    .as_deref()
                    .map(|n| {
                        c.title.to_lowercase().contains(n)
                            || c.description.to_lowercase().contains(n)
                            || c.agency.to_lowercase().contains(n)
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.posted_date.cmp(&a.posted_date));
        let total = rows.len();
        let limit = if query.limit == 0 { total } else { query.limit };
        (total, rows.into_iter().skip(query.skip).take(limit).collect())
    }

    // ── aggregates for the read API ──────────────────────────────────────

    pub async fn counts(&self) -> StoreCounts {
        let state = self.state.lock().await;
        let mut by_category = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        for record in state.canonical.values() {
            *by_category
                .entry(record.category.as_str().to_string())
                .or_insert(0usize) += 1;
            *by_status
                .entry(record.status.as_str().to_string())
                .or_insert(0usize) += 1;
        }
        let mut by_source = BTreeMap::new();
        for (source, _) in state.raw.keys() {
            *by_source.entry(source.clone()).or_insert(0usize) += 1;
        }
        StoreCounts {
            raw_items: state.raw.len(),
            canonical_records: state.canonical.len(),
            by_category,
            by_source,
            by_status,
        }
    }

    /// Daily counts of newly observed items (version-1 fetch dates),
    /// ascending, truncated to the most recent `days` buckets.
    pub async fn daily_new_counts(&self, days: usize) -> Vec<(NaiveDate, usize)> {
        let state = self.state.lock().await;
        let mut buckets: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for versions in state.raw.values() {
            if let Some(first) = versions.first() {
                *buckets.entry(first.fetched_at.date_naive()).or_insert(0) += 1;
            }
        }
        let out: Vec<(NaiveDate, usize)> = buckets.into_iter().collect();
        let start = out.len().saturating_sub(days);
        out[start..].to_vec()
    }

    // ── checkpoints ──────────────────────────────────────────────────────

    pub async fn get_checkpoint(&self, source_name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.checkpoints.get(source_name).cloned()
    }

    pub async fn set_checkpoint(
        &self,
        source_name: &str,
        source_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .checkpoints
            .insert(source_name.to_string(), source_id.to_string());
        let bytes = serde_json::to_vec_pretty(&state.checkpoints)?;
        write_atomic(&self.root.join(CHECKPOINT_FILE), &bytes).await?;
        info!(source = source_name, checkpoint = source_id, "checkpoint advanced");
        Ok(())
    }

    // ── persistence internals ────────────────────────────────────────────

    async fn append_raw_line(&self, record: &RawRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(RAW_JOURNAL))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn persist_canonical(&self, state: &StoreState) -> Result<(), StoreError> {
        let records: Vec<&CanonicalRecord> = state.canonical.values().collect();
        let bytes = serde_json::to_vec_pretty(&records)?;
        write_atomic(&self.root.join(CANONICAL_FILE), &bytes).await
    }

    async fn persist_pending(&self, state: &StoreState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&state.pending)?;
        write_atomic(&self.root.join(PENDING_FILE), &bytes).await
    }
}

#[derive(Debug, Clone)]
pub struct StoreCounts {
    pub raw_items: usize,
    pub canonical_records: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
}

async fn read_json_if_present<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let text = fs::read_to_string(path).await?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Replace a file's contents via temp-file write + rename so readers never
/// observe a partial write.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err.into())
        }
    }
}

// ── retry policy ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether another attempt could help.
pub trait RetryClass {
    fn disposition(&self) -> RetryDisposition;
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Drive an operation through bounded exponential backoff. Non-retryable
/// errors propagate immediately; exhaustion returns the last error.
pub async fn run_with_retry<T, E, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    E: RetryClass,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.disposition() == RetryDisposition::NonRetryable
                    || attempt >= policy.max_retries
                {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}

// ── concurrency governor ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket sustaining roughly `rate_per_sec` tokens per second with a
    /// burst of one second's worth.
    pub fn for_rate(rate_per_sec: f64) -> Self {
        let rate = rate_per_sec.max(0.1);
        let capacity = rate.ceil().max(1.0) as u32;
        Self::new(capacity, Duration::from_secs_f64(1.0 / rate))
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Two independent ceilings: a bounded pool of adapter tasks and a
/// per-network-domain request rate shared by everyone hitting that domain.
/// Acquisition only ever delays callers, it never fails them.
#[derive(Debug)]
pub struct Governor {
    task_slots: Arc<Semaphore>,
    rate_per_domain: f64,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl Governor {
    pub fn new(max_tasks: usize, rate_per_domain: f64) -> Self {
        Self {
            task_slots: Arc::new(Semaphore::new(max_tasks.max(1))),
            rate_per_domain,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Scoped slot in the bounded adapter pool; held for the duration of one
    /// adapter task and released on drop, success or failure.
    pub async fn task_permit(&self) -> OwnedSemaphorePermit {
        self.task_slots
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed")
    }

    /// Consume one request token for `domain`, waiting for refill if needed.
    pub async fn throttle(&self, domain: &str) {
        let bucket = {
            let mut buckets = self.buckets.lock().await;
            buckets
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::for_rate(self.rate_per_domain)))
                .clone()
        };
        bucket.take().await;
    }
}

// ── governed HTTP fetch ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl RetryClass for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// HTTP client that routes every request through the shared governor and
/// retries transient failures with exponential backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    governor: Arc<Governor>,
    backoff: BackoffPolicy,
}

/// Network domain of a URL, used as the rate-limiting key.
pub fn domain_of(url: &str) -> &str {
    let rest = url.split("://").nth(1).unwrap_or(url);
    match rest.split('/').next() {
        Some(domain) if !domain.is_empty() => domain,
        _ => rest,
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, governor: Arc<Governor>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            governor,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let domain = domain_of(url).to_string();
        let span = info_span!("http_fetch", %run_id, domain = %domain, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            // Both the task permit (held by the caller) and a rate token are
            // required before a request goes out; every retry pays again.
            self.governor.throttle(&domain).await;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_core::{CanonicalRecord, OpportunityStatus, Provenance};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn raw(source: &str, id: &str, title: &str) -> RawRecord {
        let mut extracted = BTreeMap::new();
        extracted.insert("title".to_string(), title.to_string());
        RawRecord::new(
            source,
            id,
            format!("https://example.com/{id}"),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap(),
            extracted,
        )
    }

    #[tokio::test]
    async fn upsert_raw_is_idempotent_for_unchanged_content() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();

        let first = store.upsert_raw(raw("sam_gov", "A-1", "Roadwork")).await.unwrap();
        let second = store.upsert_raw(raw("sam_gov", "A-1", "Roadwork")).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Unchanged);
        let current = store.current_raw("sam_gov", "A-1").await.unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(store.raw_history("sam_gov", "A-1").await.len(), 1);
    }

    #[tokio::test]
    async fn changed_content_appends_exactly_one_version() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();

        store.upsert_raw(raw("sam_gov", "A-1", "Roadwork")).await.unwrap();
        let outcome = store
            .upsert_raw(raw("sam_gov", "A-1", "Roadwork (amended)"))
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome::NewVersion);
        let history = store.raw_history("sam_gov", "A-1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].extracted["title"], "Roadwork");
        assert_eq!(history[1].version, 2);
    }

    #[tokio::test]
    async fn store_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RecordStore::open(dir.path()).await.unwrap();
            store.upsert_raw(raw("sam_gov", "A-1", "Roadwork")).await.unwrap();
            store
                .upsert_raw(raw("sam_gov", "A-1", "Roadwork v2"))
                .await
                .unwrap();
            store.set_checkpoint("sam_gov", "A-1").await.unwrap();
        }

        let store = RecordStore::open(dir.path()).await.unwrap();
        assert_eq!(store.raw_history("sam_gov", "A-1").await.len(), 2);
        assert_eq!(store.get_checkpoint("sam_gov").await.as_deref(), Some("A-1"));
        // Pending set survived too: the pipeline still owes this item a pass.
        assert_eq!(store.take_pending().await.len(), 1);
    }

    #[tokio::test]
    async fn pending_drains_only_when_cleared() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        store.upsert_raw(raw("sam_gov", "A-1", "Roadwork")).await.unwrap();
        store.upsert_raw(raw("nyc", "B-2", "Bridges")).await.unwrap();

        assert_eq!(store.take_pending().await.len(), 2);
        store
            .clear_pending(&[("sam_gov".to_string(), "A-1".to_string())])
            .await
            .unwrap();
        let remaining = store.take_pending().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].source_name, "nyc");
    }

    #[tokio::test]
    async fn canonical_listing_filters_and_searches() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();

        let mut a = CanonicalRecord::new(Provenance::new("sam_gov", "A-1"), Utc::now());
        a.title = "Road Resurfacing Contract".to_string();
        a.agency = "department of transportation".to_string();
        a.status = OpportunityStatus::Active;
        let mut b = CanonicalRecord::new(Provenance::new("nyc", "B-2"), Utc::now());
        b.title = "Hospital Supplies".to_string();
        b.status = OpportunityStatus::Closed;
        store.upsert_canonical(a).await.unwrap();
        store.upsert_canonical(b).await.unwrap();

        let (total, rows) = store
            .list_canonical(&CanonicalQuery {
                search: Some("resurfacing".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(total, 1);
        assert_eq!(rows[0].title, "Road Resurfacing Contract");

        let (total, _) = store
            .list_canonical(&CanonicalQuery {
                status: Some("closed".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(total, 1);

        let (total, _) = store
            .list_canonical(&CanonicalQuery {
                source: Some("sam_gov".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn daily_counts_bucket_first_observations() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        store.upsert_raw(raw("sam_gov", "A-1", "One")).await.unwrap();
        store.upsert_raw(raw("sam_gov", "A-2", "Two")).await.unwrap();
        // A version bump is not a new observation.
        store.upsert_raw(raw("sam_gov", "A-1", "One amended")).await.unwrap();

        let buckets = store.daily_new_counts(90).await;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].1, 2);
    }

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl RetryClass for TestError {
        fn disposition(&self) -> RetryDisposition {
            if self.transient {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
    }

    #[tokio::test]
    async fn retry_attempts_are_bounded() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let attempts = AtomicUsize::new(0);
        let result: Result<(), TestError> = run_with_retry(&policy, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { transient: true }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_never_retried() {
        let policy = BackoffPolicy::default();
        let attempts = AtomicUsize::new(0);
        let result: Result<(), TestError> = run_with_retry(&policy, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { transient: false }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_bucket_spaces_out_a_burst() {
        let bucket = TokenBucket::new(2, Duration::from_millis(40));
        let start = Instant::now();
        for _ in 0..4 {
            bucket.take().await;
        }
        // Two tokens are free; the next two each wait a refill interval.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn governor_pool_is_bounded() {
        let governor = Governor::new(2, 10.0);
        let first = governor.task_permit().await;
        let second = governor.task_permit().await;
        let third = tokio::time::timeout(Duration::from_millis(50), governor.task_permit()).await;
        assert!(third.is_err(), "third permit should block while two are held");
        drop(first);
        let fourth = tokio::time::timeout(Duration::from_millis(200), governor.task_permit()).await;
        assert!(fourth.is_ok());
        drop(second);
    }

    #[test]
    fn domain_extraction_handles_schemes_and_paths() {
        assert_eq!(domain_of("https://sam.gov/api/opps?page=1"), "sam.gov");
        assert_eq!(domain_of("http://www.nyc.gov"), "www.nyc.gov");
        assert_eq!(domain_of("nyc.gov/page"), "nyc.gov");
    }
}
