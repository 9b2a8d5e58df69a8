//! Collection orchestration and the canonicalization pipeline.

pub mod canonicalize;
pub mod classify;
pub mod dedup;
pub mod normalize;
pub mod orchestrator;
pub mod text;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bidwatch_storage::{BackoffPolicy, Governor, HttpClientConfig, HttpFetcher, RecordStore};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use canonicalize::{PipelineSummary, ProcessingPipeline};
pub use classify::{CategoryClassifier, ClassifierModel};
pub use dedup::{DedupConfig, Deduper};
pub use orchestrator::{AdapterReport, AdapterSpec, Orchestrator, RunReport};

pub const CRATE_NAME: &str = "bidwatch-pipeline";

/// Runtime settings, read from `BIDWATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub data_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub sources_file: PathBuf,
    pub max_concurrency: usize,
    pub rate_limit_per_domain: f64,
    pub request_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub similarity_threshold: f64,
    pub classifier_model_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub collect_cron_1: String,
    pub collect_cron_2: String,
    pub user_agent: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            snapshot_dir: PathBuf::from("./data/snapshots"),
            sources_file: PathBuf::from("sources.yaml"),
            max_concurrency: 5,
            rate_limit_per_domain: 2.0,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 250,
            similarity_threshold: DedupConfig::default().similarity_threshold,
            classifier_model_path: None,
            scheduler_enabled: false,
            collect_cron_1: "0 0 6 * * *".to_string(),
            collect_cron_2: "0 0 18 * * *".to_string(),
            user_agent: "bidwatch/0.1".to_string(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.parse().ok())
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: env_var("BIDWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            snapshot_dir: env_var("BIDWATCH_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_dir),
            sources_file: env_var("BIDWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            max_concurrency: env_parsed("BIDWATCH_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency),
            rate_limit_per_domain: env_parsed("BIDWATCH_RATE_LIMIT_PER_DOMAIN")
                .unwrap_or(defaults.rate_limit_per_domain),
            request_timeout_secs: env_parsed("BIDWATCH_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout_secs),
            max_retries: env_parsed("BIDWATCH_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_base_delay_ms: env_parsed("BIDWATCH_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            similarity_threshold: env_parsed("BIDWATCH_SIMILARITY_THRESHOLD")
                .unwrap_or(defaults.similarity_threshold),
            classifier_model_path: env_var("BIDWATCH_CLASSIFIER_MODEL").map(PathBuf::from),
            scheduler_enabled: env_var("BIDWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            collect_cron_1: env_var("BIDWATCH_COLLECT_CRON_1").unwrap_or(defaults.collect_cron_1),
            collect_cron_2: env_var("BIDWATCH_COLLECT_CRON_2").unwrap_or(defaults.collect_cron_2),
            user_agent: env_var("BIDWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..Default::default()
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            similarity_threshold: self.similarity_threshold,
            ..Default::default()
        }
    }
}

// ── source registry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_specs(&self) -> Vec<AdapterSpec> {
        self.sources
            .iter()
            .filter(|source| source.enabled)
            .map(|source| AdapterSpec {
                name: source.source_id.clone(),
                fixture_path: match source.mode {
                    SourceMode::Fixture => source.fixture_path.clone(),
                    SourceMode::Live => None,
                },
            })
            .collect()
    }
}

// ── top-level facade ─────────────────────────────────────────────────────

/// Owns the store, orchestrator, and pipeline; the CLI and scheduler drive
/// everything through this.
pub struct Collector {
    config: CollectorConfig,
    store: Arc<RecordStore>,
    orchestrator: Arc<Orchestrator>,
    pipeline: Arc<ProcessingPipeline>,
}

impl Collector {
    pub async fn init(config: CollectorConfig) -> Result<Self> {
        let store = Arc::new(
            RecordStore::open(&config.data_dir)
                .await
                .context("opening record store")?,
        );
        let governor = Arc::new(Governor::new(
            config.max_concurrency,
            config.rate_limit_per_domain,
        ));
        let http = Arc::new(HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(config.request_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: config.backoff(),
            },
            governor.clone(),
        )?);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            governor,
            http,
            config.backoff(),
            config.snapshot_dir.clone(),
        ));
        let classifier = CategoryClassifier::load(config.classifier_model_path.as_deref());
        let pipeline = Arc::new(ProcessingPipeline::new(
            store.clone(),
            classifier,
            Deduper::new(config.dedup_config()),
        ));
        Ok(Self {
            config,
            store,
            orchestrator,
            pipeline,
        })
    }

    pub fn store(&self) -> Arc<RecordStore> {
        self.store.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.orchestrator.cancellation_token()
    }

    /// Collect from the named adapters, or from every enabled source in the
    /// registry file when no names are given.
    pub async fn collect(&self, adapter_names: &[String]) -> Result<RunReport> {
        let specs = if adapter_names.is_empty() {
            match SourceRegistry::load(&self.config.sources_file) {
                Ok(registry) => registry.enabled_specs(),
                Err(err) => {
                    warn!(error = %err, "no usable source registry, running every known adapter");
                    bidwatch_adapters::ADAPTER_NAMES
                        .iter()
                        .map(|name| AdapterSpec::live(*name))
                        .collect()
                }
            }
        } else {
            adapter_names
                .iter()
                .map(|name| AdapterSpec::live(name.clone()))
                .collect()
        };
        Ok(self.orchestrator.run_named(specs).await)
    }

    pub async fn process(&self) -> Result<PipelineSummary> {
        Ok(self.pipeline.run().await?)
    }

    pub async fn run_cycle(&self) -> Result<(RunReport, PipelineSummary)> {
        let run = self.collect(&[]).await?;
        let summary = self.process().await?;
        Ok((run, summary))
    }

    /// Cron-driven collect+process cycles, when enabled in config.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [
            self.config.collect_cron_1.clone(),
            self.config.collect_cron_2.clone(),
        ] {
            let collector = self.clone();
            let job = Job::new_async(cron.as_str(), move |_id, _scheduler| {
                let collector = collector.clone();
                Box::pin(async move {
                    match collector.run_cycle().await {
                        Ok((run, summary)) => info!(
                            run_id = %run.run_id,
                            collected = run.total_processed(),
                            canonicalized = summary.processed,
                            "scheduled cycle finished"
                        ),
                        Err(err) => error!(error = %err, "scheduled cycle failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            scheduler.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(scheduler))
    }
}
