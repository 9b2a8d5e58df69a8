//! Source adapter contracts + portal adapter implementations.
//!
//! Each adapter turns one public procurement portal into a newest-first
//! sequence of [`RawRecord`]s, truncated at the orchestrator-supplied
//! checkpoint so incremental runs stop where the last durable run ended.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bidwatch_core::RawRecord;
use bidwatch_storage::{FetchError, HttpFetcher, RetryClass, RetryDisposition};
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-adapters";

/// How an adapter reaches its portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Plain request/response endpoint.
    Api,
    /// Rendered-page session; the adapter keeps the last page around for
    /// postmortem snapshots.
    InteractiveSession,
}

/// Per-run inputs handed to each adapter by the orchestrator.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub checkpoint: Option<String>,
    /// When set, the adapter reads this captured page instead of fetching,
    /// so a whole collection cycle can run from fixtures.
    pub fixture_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl RetryClass for AdapterError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) => RetryDisposition::Retryable,
            Self::Permanent(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => Self::Transient(err.to_string()),
            RetryDisposition::NonRetryable => Self::Permanent(err.to_string()),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn base_domain(&self) -> &'static str;
    fn capability(&self) -> Capability;

    /// Extract one run's worth of records, newest first, stopping at the
    /// checkpoint. Restartable: the next run resumes from whatever the
    /// orchestrator durably committed.
    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError>;

    /// Best-effort capture of session state for debugging a failed run.
    fn diagnostic_snapshot(&self) -> Option<String> {
        None
    }
}

async fn load_body(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    url: &str,
) -> Result<Vec<u8>, AdapterError> {
    if let Some(path) = &ctx.fixture_path {
        return std::fs::read(path)
            .map_err(|err| AdapterError::Permanent(format!("reading fixture {path:?}: {err}")));
    }
    let response = http.fetch_bytes(ctx.run_id, url).await?;
    Ok(response.body)
}

fn utf8_body(body: Vec<u8>) -> Result<String, AdapterError> {
    String::from_utf8(body).map_err(|err| AdapterError::Permanent(format!("non-utf8 body: {err}")))
}

// ── SAM.gov (federal opportunities API) ──────────────────────────────────

const SAM_SEARCH_URL: &str =
    "https://api.sam.gov/opportunities/v2/search?limit=100&sortBy=-modifiedDate";

#[derive(Debug, Default)]
pub struct SamGovAdapter;

/// Parse a SAM.gov search response into raw records, newest first,
/// truncating at the checkpointed notice id. Malformed entries are skipped
/// and counted against nobody; a malformed document is a permanent failure.
pub fn parse_sam_notices(
    body: &str,
    checkpoint: Option<&str>,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawRecord>, AdapterError> {
    let doc: JsonValue = serde_json::from_str(body)
        .map_err(|err| AdapterError::Permanent(format!("unexpected response shape: {err}")))?;
    let notices = doc
        .get("opportunitiesData")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            AdapterError::Permanent("missing opportunitiesData array".to_string())
        })?;

    let mut records = Vec::new();
    for notice in notices {
        let Some(source_id) = notice.get("noticeId").and_then(JsonValue::as_str) else {
            warn!("sam_gov notice without noticeId, skipping");
            continue;
        };
        if checkpoint == Some(source_id) {
            break;
        }

        let mut extracted = BTreeMap::new();
        let mut put = |key: &str, value: Option<&str>| {
            if let Some(value) = value {
                let value = value.trim();
                if !value.is_empty() {
                    extracted.insert(key.to_string(), value.to_string());
                }
            }
        };
        put("title", notice.get("title").and_then(JsonValue::as_str));
        put(
            "agency",
            notice.get("fullParentPathName").and_then(JsonValue::as_str),
        );
        put(
            "posted_date",
            notice.get("postedDate").and_then(JsonValue::as_str),
        );
        put(
            "due_date",
            notice.get("responseDeadLine").and_then(JsonValue::as_str),
        );
        put(
            "description",
            notice.get("description").and_then(JsonValue::as_str),
        );
        if let Some(active) = notice.get("active").and_then(JsonValue::as_str) {
            let status = if active.eq_ignore_ascii_case("yes") {
                "active"
            } else {
                "closed"
            };
            extracted.insert("status".to_string(), status.to_string());
        }
        if let Some(amount) = notice
            .get("award")
            .and_then(|award| award.get("amount"))
            .and_then(JsonValue::as_str)
        {
            extracted.insert("estimated_value".to_string(), amount.to_string());
        }

        let source_url = notice
            .get("uiLink")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://sam.gov/opp/{source_id}/view"));

        records.push(RawRecord::new(
            "sam_gov",
            source_id,
            source_url,
            fetched_at,
            extracted,
        ));
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for SamGovAdapter {
    fn name(&self) -> &'static str {
        "sam_gov"
    }

    fn base_domain(&self) -> &'static str {
        "api.sam.gov"
    }

    fn capability(&self) -> Capability {
        Capability::Api
    }

    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let body = load_body(http, ctx, SAM_SEARCH_URL).await?;
        parse_sam_notices(&utf8_body(body)?, ctx.checkpoint.as_deref(), ctx.fetched_at)
    }
}

// ── NYC current solicitations (rendered HTML table) ──────────────────────

const NYC_LISTING_URL: &str =
    "https://www.nyc.gov/site/mocs/opportunities/current-solicitations.page";

#[derive(Debug, Default)]
pub struct NycProcurementAdapter {
    last_page: Mutex<Option<String>>,
}

/// Parse the solicitations table: one row per opportunity with title link,
/// agency, and due date cells. Rows that do not fit the shape are skipped.
pub fn parse_nyc_solicitations(
    body: &str,
    checkpoint: Option<&str>,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawRecord>, AdapterError> {
    let document = Html::parse_document(body);
    let row_sel = Selector::parse("table tbody tr")
        .map_err(|err| AdapterError::Permanent(err.to_string()))?;
    let cell_sel =
        Selector::parse("td").map_err(|err| AdapterError::Permanent(err.to_string()))?;
    let link_sel =
        Selector::parse("a").map_err(|err| AdapterError::Permanent(err.to_string()))?;

    let mut records = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<_> = row.select(&cell_sel).collect();
        if cells.len() < 3 {
            warn!("nyc_procurement row with too few cells, skipping");
            continue;
        }

        let title = cells[0].text().collect::<String>().trim().to_string();
        let agency = cells[1].text().collect::<String>().trim().to_string();
        let due_date = cells[2].text().collect::<String>().trim().to_string();
        let link = cells[0]
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string);

        let source_id = link
            .as_deref()
            .and_then(|l| l.rsplit('/').find(|seg| !seg.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| title.chars().take(40).collect());
        if source_id.is_empty() {
            warn!("nyc_procurement row without id or title, skipping");
            continue;
        }
        if checkpoint == Some(source_id.as_str()) {
            break;
        }

        let mut extracted = BTreeMap::new();
        for (key, value) in [("title", &title), ("agency", &agency), ("due_date", &due_date)] {
            if !value.is_empty() {
                extracted.insert(key.to_string(), value.clone());
            }
        }
        if let Some(link) = &link {
            extracted.insert("link".to_string(), link.clone());
        }

        let source_url = link.unwrap_or_else(|| NYC_LISTING_URL.to_string());
        records.push(RawRecord::new(
            "nyc_procurement",
            source_id,
            source_url,
            fetched_at,
            extracted,
        ));
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for NycProcurementAdapter {
    fn name(&self) -> &'static str {
        "nyc_procurement"
    }

    fn base_domain(&self) -> &'static str {
        "www.nyc.gov"
    }

    fn capability(&self) -> Capability {
        Capability::InteractiveSession
    }

    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let body = utf8_body(load_body(http, ctx, NYC_LISTING_URL).await?)?;
        if let Ok(mut last_page) = self.last_page.lock() {
            *last_page = Some(body.clone());
        }
        parse_nyc_solicitations(&body, ctx.checkpoint.as_deref(), ctx.fetched_at)
    }

    fn diagnostic_snapshot(&self) -> Option<String> {
        self.last_page.lock().ok().and_then(|page| page.clone())
    }
}

// ── registry ─────────────────────────────────────────────────────────────

pub const ADAPTER_NAMES: &[&str] = &["sam_gov", "nyc_procurement"];

pub fn adapter_for_source(name: &str) -> Option<Box<dyn SourceAdapter>> {
    match name {
        "sam_gov" => Some(Box::new(SamGovAdapter)),
        "nyc_procurement" => Some(Box::new(NycProcurementAdapter::default())),
        _ => None,
    }
}
