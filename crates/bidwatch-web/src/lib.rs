//! Read-only presentation API over the record store.
//!
//! The pipeline is the only writer; nothing here mutates anything.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use bidwatch_core::{CanonicalRecord, RawRecord};
use bidwatch_storage::{CanonicalQuery, RawQuery, RecordStore};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "bidwatch-web";

const MAX_PAGE_SIZE: usize = 500;
const DEFAULT_PAGE_SIZE: usize = 50;
const TIMELINE_DAYS: usize = 90;

pub fn app(store: Arc<RecordStore>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/records/raw", get(raw_records_handler))
        .route("/api/records/canonical", get(canonical_records_handler))
        .route("/api/sources", get(sources_handler))
        .with_state(store)
}

pub async fn serve(port: u16, store: Arc<RecordStore>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(store)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct CategoryCount {
    category: String,
    count: usize,
}

#[derive(Debug, Serialize)]
struct SourceCount {
    source: String,
    count: usize,
}

#[derive(Debug, Serialize)]
struct StatusCount {
    status: String,
    count: usize,
}

#[derive(Debug, Serialize)]
struct TimelineBucket {
    date: NaiveDate,
    count: usize,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    raw_count: usize,
    canonical_count: usize,
    categories: Vec<CategoryCount>,
    sources: Vec<SourceCount>,
    statuses: Vec<StatusCount>,
    timeline: Vec<TimelineBucket>,
}

async fn stats_handler(State(store): State<Arc<RecordStore>>) -> Json<StatsResponse> {
    let counts = store.counts().await;
    let timeline = store
        .daily_new_counts(TIMELINE_DAYS)
        .await
        .into_iter()
        .map(|(date, count)| TimelineBucket { date, count })
        .collect();

    Json(StatsResponse {
        raw_count: counts.raw_items,
        canonical_count: counts.canonical_records,
        categories: sorted_desc(counts.by_category)
            .map(|(category, count)| CategoryCount { category, count })
            .collect(),
        sources: sorted_desc(counts.by_source)
            .map(|(source, count)| SourceCount { source, count })
            .collect(),
        statuses: sorted_desc(counts.by_status)
            .map(|(status, count)| StatusCount { status, count })
            .collect(),
        timeline,
    })
}

fn sorted_desc(
    counts: std::collections::BTreeMap<String, usize>,
) -> impl Iterator<Item = (String, usize)> {
    let mut rows: Vec<(String, usize)> = counts.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.into_iter()
}

fn clamp_page(limit: Option<usize>, skip: Option<usize>) -> (usize, usize) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (limit, skip.unwrap_or(0))
}

#[derive(Debug, Deserialize, Default)]
struct RawListParams {
    source: Option<String>,
    limit: Option<usize>,
    skip: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RawListResponse {
    total: usize,
    records: Vec<RawRecord>,
}

async fn raw_records_handler(
    State(store): State<Arc<RecordStore>>,
    Query(params): Query<RawListParams>,
) -> Json<RawListResponse> {
    let (limit, skip) = clamp_page(params.limit, params.skip);
    let (total, records) = store
        .list_raw(&RawQuery {
            source: params.source,
            limit,
            skip,
        })
        .await;
    Json(RawListResponse { total, records })
}

#[derive(Debug, Deserialize, Default)]
struct CanonicalListParams {
    source: Option<String>,
    category: Option<String>,
    status: Option<String>,
    search: Option<String>,
    limit: Option<usize>,
    skip: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CanonicalListResponse {
    total: usize,
    records: Vec<CanonicalRecord>,
}

async fn canonical_records_handler(
    State(store): State<Arc<RecordStore>>,
    Query(params): Query<CanonicalListParams>,
) -> Json<CanonicalListResponse> {
    let (limit, skip) = clamp_page(params.limit, params.skip);
    let (total, records) = store
        .list_canonical(&CanonicalQuery {
            source: params.source,
            category: params.category,
            status: params.status,
            search: params.search,
            limit,
            skip,
        })
        .await;
    Json(CanonicalListResponse { total, records })
}

async fn sources_handler(State(store): State<Arc<RecordStore>>) -> Json<Vec<SourceCount>> {
    let counts = store.counts().await;
    Json(
        sorted_desc(counts.by_source)
            .map(|(source, count)| SourceCount { source, count })
            .collect(),
    )
}
