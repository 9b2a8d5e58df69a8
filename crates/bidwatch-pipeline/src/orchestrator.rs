//! Drives adapters with bounded concurrency, rate limiting, retries, and
//! checkpointing, forwarding every successful extraction to the raw store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bidwatch_adapters::{
    adapter_for_source, AdapterContext, AdapterError, Capability, SourceAdapter,
};
use bidwatch_storage::{run_with_retry, BackoffPolicy, Governor, HttpFetcher, RecordStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One named unit of collection work, optionally pinned to a captured page.
#[derive(Debug, Clone)]
pub struct AdapterSpec {
    pub name: String,
    pub fixture_path: Option<PathBuf>,
}

impl AdapterSpec {
    pub fn live(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixture_path: None,
        }
    }
}

pub struct AdapterRun {
    pub adapter: Box<dyn SourceAdapter>,
    pub fixture_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdapterReport {
    pub items_processed: usize,
    pub items_failed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_adapter: BTreeMap<String, AdapterReport>,
}

impl RunReport {
    pub fn total_processed(&self) -> usize {
        self.per_adapter.values().map(|r| r.items_processed).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.per_adapter.values().map(|r| r.items_failed).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.total_failed() > 0 || self.per_adapter.values().any(|r| r.error.is_some())
    }
}

pub struct Orchestrator {
    store: Arc<RecordStore>,
    governor: Arc<Governor>,
    http: Arc<HttpFetcher>,
    backoff: BackoffPolicy,
    snapshot_dir: PathBuf,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<RecordStore>,
        governor: Arc<Governor>,
        http: Arc<HttpFetcher>,
        backoff: BackoffPolicy,
        snapshot_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            governor,
            http,
            backoff,
            snapshot_dir,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops new extraction attempts when cancelled; in-flight
    /// items finish and already-durable writes stay put.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve adapter names against the registry and run them. Unknown
    /// names become per-adapter errors, never a run failure.
    pub async fn run_named(&self, specs: Vec<AdapterSpec>) -> RunReport {
        let mut units = Vec::new();
        let mut unresolved = BTreeMap::new();
        for spec in specs {
            match adapter_for_source(&spec.name) {
                Some(adapter) => units.push(AdapterRun {
                    adapter,
                    fixture_path: spec.fixture_path,
                }),
                None => {
                    warn!(adapter = %spec.name, "unknown adapter requested");
                    unresolved.insert(
                        spec.name.clone(),
                        AdapterReport {
                            error: Some(format!("unknown adapter '{}'", spec.name)),
                            ..Default::default()
                        },
                    );
                }
            }
        }
        let mut report = self.run_units(units).await;
        report.per_adapter.extend(unresolved);
        report
    }

    /// Run each unit as an independent task. One adapter's failure never
    /// aborts the others; partial completion is reported, never swallowed.
    pub async fn run_units(&self, units: Vec<AdapterRun>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, adapters = units.len(), "collection run started");

        let mut tasks: JoinSet<(String, AdapterReport)> = JoinSet::new();
        for unit in units {
            let store = self.store.clone();
            let governor = self.governor.clone();
            let http = self.http.clone();
            let backoff = self.backoff;
            let snapshot_dir = self.snapshot_dir.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let name = unit.adapter.name().to_string();
                let report = run_one_adapter(
                    store,
                    governor,
                    http,
                    backoff,
                    snapshot_dir,
                    cancel,
                    run_id,
                    unit,
                )
                .await;
                (name, report)
            });
        }

        let mut per_adapter = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, report)) => {
                    per_adapter.insert(name, report);
                }
                Err(err) => {
                    warn!(error = %err, "adapter task aborted");
                    per_adapter.insert(
                        format!("aborted-task-{}", per_adapter.len()),
                        AdapterReport {
                            error: Some(err.to_string()),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            per_adapter,
        };
        info!(
            %run_id,
            processed = report.total_processed(),
            failed = report.total_failed(),
            "collection run finished"
        );
        report
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_adapter(
    store: Arc<RecordStore>,
    governor: Arc<Governor>,
    http: Arc<HttpFetcher>,
    backoff: BackoffPolicy,
    snapshot_dir: PathBuf,
    cancel: CancellationToken,
    run_id: Uuid,
    unit: AdapterRun,
) -> AdapterReport {
    let mut report = AdapterReport::default();
    let adapter = unit.adapter;
    let name = adapter.name();

    if cancel.is_cancelled() {
        report.error = Some("run cancelled".to_string());
        return report;
    }

    // Bounded pool: held for the whole task, released on any exit path.
    let _slot = governor.task_permit().await;

    let checkpoint = store.get_checkpoint(name).await;
    let ctx = AdapterContext {
        run_id,
        fetched_at: Utc::now(),
        checkpoint,
        fixture_path: unit.fixture_path,
    };
    info!(
        adapter = name,
        checkpoint = ctx.checkpoint.as_deref().unwrap_or("none"),
        "adapter started"
    );

    let adapter_ref = adapter.as_ref();
    let http_ref = http.as_ref();
    let cancel_ref = &cancel;
    let ctx_ref = &ctx;
    let extraction = run_with_retry(&backoff, move |attempt| async move {
        if cancel_ref.is_cancelled() {
            return Err(AdapterError::Permanent("run cancelled".to_string()));
        }
        if attempt > 0 {
            debug!(adapter = adapter_ref.name(), attempt, "retrying extraction");
        }
        adapter_ref.extract(http_ref, ctx_ref).await
    })
    .await;

    let records = match extraction {
        Ok(records) => records,
        Err(err) => {
            if adapter.capability() == Capability::InteractiveSession {
                write_session_snapshot(&snapshot_dir, name, run_id, adapter.diagnostic_snapshot())
                    .await;
            }
            warn!(adapter = name, error = %err, "adapter failed");
            report.error = Some(err.to_string());
            return report;
        }
    };

    let mut newest_stored: Option<String> = None;
    let mut aborted = false;
    for record in records {
        if cancel.is_cancelled() {
            report.error = Some("run cancelled".to_string());
            aborted = true;
            break;
        }
        let source_id = record.source_id.clone();
        match store.upsert_raw(record).await {
            Ok(_) => {
                report.items_processed += 1;
                if newest_stored.is_none() {
                    newest_stored = Some(source_id);
                }
            }
            Err(err) => {
                warn!(adapter = name, id = %source_id, error = %err, "failed to store item");
                report.items_failed += 1;
            }
        }
    }

    // The new checkpoint covers the stream back to the previous one, so it
    // moves only once every item of a completed stream is durably stored.
    if !aborted && report.items_failed == 0 {
        if let Some(newest) = newest_stored {
            if let Err(err) = store.set_checkpoint(name, &newest).await {
                warn!(adapter = name, error = %err, "failed to persist checkpoint");
                report.error = Some(format!("checkpoint write failed: {err}"));
            }
        }
    }

    info!(
        adapter = name,
        processed = report.items_processed,
        failed = report.items_failed,
        "adapter finished"
    );
    report
}

/// Best-effort postmortem capture; never allowed to fail the run.
async fn write_session_snapshot(dir: &Path, adapter: &str, run_id: Uuid, page: Option<String>) {
    let Some(page) = page else {
        debug!(adapter, "no session state to snapshot");
        return;
    };
    let target_dir = dir.join(adapter);
    if let Err(err) = fs::create_dir_all(&target_dir).await {
        warn!(adapter, error = %err, "could not create snapshot directory");
        return;
    }
    let path = target_dir.join(format!("{run_id}.html"));
    match fs::write(&path, page).await {
        Ok(()) => warn!(adapter, path = %path.display(), "session snapshot saved"),
        Err(err) => warn!(adapter, error = %err, "could not write session snapshot"),
    }
}
