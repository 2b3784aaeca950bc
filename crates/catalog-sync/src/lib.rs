//! Sync pipeline orchestration: registry and env configuration, concurrent source
//! crawls, normalization, clustering, and the file/staging outputs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use catalog_adapters::{adapter_for_source, AdapterContext, AdapterSettings, Crawlability, SourceAdapter};
use catalog_core::{Cluster, NormalizedRecord, RecordKey};
use catalog_storage::{
    BackoffPolicy, CircuitBreakerConfig, CircuitState, HttpClientConfig, HttpFetcher, ShardWriter,
    SourcePolicy, TokenBucketConfig,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dedup;
pub mod normalize;
pub mod staging;

pub use dedup::{DedupConfig, DedupEngine, DedupOutcome, DedupeError, ReviewCandidate};
pub use normalize::{NormalizationError, NormalizationRules, Normalizer};
pub use staging::{MemoryStagingBackend, PgStagingBackend, StagingBackend, StagingReceipt};

pub const CRATE_NAME: &str = "catalog-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub crawlability: Crawlability,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub circuit: Option<CircuitConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            source_id: self.source_id.clone(),
            crawlability: self.crawlability,
            listing_urls: self.listing_urls.clone(),
            fixture_path: self.fixture_path.clone(),
            page_size: self.page_size.unwrap_or(50).max(1),
        }
    }

    /// Fetch limits for this source, falling back to `base` for anything unset.
    pub fn policy(&self, base: SourcePolicy) -> SourcePolicy {
        let mut policy = base;
        if let Some(n) = self.concurrency {
            policy.concurrency = n.max(1);
        }
        if let Some(rate) = self.rate_limit {
            policy.token_bucket = Some(TokenBucketConfig {
                capacity: rate.capacity.max(1),
                refill_every: Duration::from_millis(rate.refill_every_ms.max(1)),
            });
        }
        if let Some(retry) = self.retry {
            policy.backoff = BackoffPolicy {
                max_retries: retry.max_retries,
                base_delay: Duration::from_millis(retry.base_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms.max(retry.base_delay_ms)),
                jitter: retry.jitter.unwrap_or(base.backoff.jitter),
            };
        }
        if let Some(circuit) = self.circuit {
            policy.circuit = CircuitBreakerConfig {
                failure_threshold: circuit.failure_threshold.max(1),
                cooldown: Duration::from_secs(circuit.cooldown_secs),
            };
        }
        policy
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    /// `None` disables shard output (staging only).
    pub output_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    /// Enables the Postgres staging backend when set.
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub dedupe: bool,
    pub max_pages: usize,
    pub merge_threshold: f64,
}

/// Reads a boolean setting; an unset or blank variable keeps `default`.
fn parse_flag(name: &str, raw: Option<&str>, default: bool) -> Result<bool> {
    let Some(value) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{name} must be a boolean (true/false, 1/0, yes/no, on/off), got {value:?}"),
    }
}

fn parse_setting<T>(name: &str, raw: Option<&str>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(default);
    };
    value
        .parse()
        .map_err(|err| anyhow::anyhow!("{name}={value:?} is invalid: {err}"))
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    parse_flag(name, std::env::var(name).ok().as_deref(), default)
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    parse_setting(name, std::env::var(name).ok().as_deref(), default)
}

impl SyncConfig {
    /// Reads the `CATALOG_*` settings. A value that is set but does not parse is an
    /// error rather than a silent fallback to the default.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workspace_root: std::env::var("CATALOG_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            output_dir: match std::env::var("CATALOG_OUTPUT_DIR") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => Some(PathBuf::from("./out")),
            },
            reports_dir: std::env::var("CATALOG_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("CATALOG_USER_AGENT")
                .unwrap_or_else(|_| "catalog-bot/0.1".to_string()),
            http_timeout_secs: env_parse("CATALOG_HTTP_TIMEOUT_SECS", 20)?,
            dedupe: env_flag("CATALOG_DEDUPE", true)?,
            max_pages: env_parse("CATALOG_MAX_PAGES", 50)?,
            merge_threshold: env_parse("CATALOG_MERGE_THRESHOLD", 0.85)?,
        })
    }

    pub fn dedup_config(&self) -> Result<DedupConfig> {
        let defaults = DedupConfig::default();
        let config = DedupConfig {
            merge_threshold: self.merge_threshold,
            review_threshold: defaults.review_threshold.min(self.merge_threshold),
            ..defaults
        };
        config.validate().context("invalid dedupe settings")?;
        Ok(config)
    }

    pub fn http_config(&self, registry: &SourceRegistry) -> HttpClientConfig {
        let mut http = HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        };
        let base = http.default_policy;
        http.per_source = registry
            .enabled()
            .map(|s| (s.source_id.clone(), s.policy(base)))
            .collect::<HashMap<_, _>>();
        http
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    PageLimit,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub status: SourceStatus,
    pub pages: usize,
    pub fetched: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub errors: Vec<String>,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub source: String,
    pub source_native_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeMode {
    Enabled,
    Disabled,
    /// Clustering failed; every record became a singleton.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSummary {
    pub root: String,
    pub manifest: String,
    pub shards: usize,
    pub entities: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub sources: Vec<SourceSummary>,
    pub fetched: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub duplicates_dropped: usize,
    pub clustered_records: usize,
    pub clusters: usize,
    pub merged_clusters: usize,
    pub review_candidates: usize,
    pub dedupe: DedupeMode,
    pub dedupe_error: Option<String>,
    pub rejected_records: Vec<RejectedRecord>,
    pub output: Option<OutputSummary>,
    pub staging: Option<StagingReceipt>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn failed_sources(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.status == SourceStatus::Failed)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub summary: RunSummary,
    pub clusters: Vec<Cluster>,
    pub review: Vec<ReviewCandidate>,
}

struct SourceOutcome {
    summary: SourceSummary,
    records: Vec<NormalizedRecord>,
    rejected: Vec<RejectedRecord>,
}

/// Page through one adapter until it runs dry, fails, hits `max_pages`, or the run is
/// cancelled. Each page is normalized as soon as it arrives, in emission order.
async fn crawl_source(
    adapter: Arc<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    normalizer: Arc<Normalizer>,
    ctx: AdapterContext,
    max_pages: usize,
    cancel: CancellationToken,
) -> SourceOutcome {
    let source_id = adapter.source_id().to_string();
    let mut summary = SourceSummary {
        source_id: source_id.clone(),
        status: SourceStatus::Completed,
        pages: 0,
        fetched: 0,
        normalized: 0,
        rejected: 0,
        errors: Vec::new(),
        circuit: CircuitState::Closed,
    };
    let mut records = Vec::new();
    let mut rejected = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            summary.status = SourceStatus::Cancelled;
            break;
        }
        let page = match adapter.fetch_page(&http, &ctx, cursor.as_deref()).await {
            Ok(page) => page,
            Err(err) if err.is_cancelled() => {
                info!(source_id = %source_id, page = summary.pages, "source fetch cancelled");
                summary.status = SourceStatus::Cancelled;
                break;
            }
            Err(err) => {
                warn!(source_id = %source_id, page = summary.pages, error = %err, "source fetch failed");
                summary.errors.push(err.to_string());
                summary.status = SourceStatus::Failed;
                break;
            }
        };
        summary.pages += 1;
        summary.fetched += page.records.len();
        for raw in &page.records {
            match normalizer.normalize(raw) {
                Ok(record) => {
                    summary.normalized += 1;
                    records.push(record);
                }
                Err(err) => {
                    warn!(source_id = %raw.source, native_id = %raw.source_native_id, error = %err, "rejected record");
                    summary.rejected += 1;
                    rejected.push(RejectedRecord {
                        source: raw.source.clone(),
                        source_native_id: raw.source_native_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        cursor = match page.next_cursor {
            Some(next) => Some(next),
            None => break,
        };
        if summary.pages >= max_pages {
            summary.status = SourceStatus::PageLimit;
            break;
        }
    }

    summary.circuit = http.circuit_state(&source_id).await;
    info!(
        source_id = %source_id,
        status = ?summary.status,
        pages = summary.pages,
        normalized = summary.normalized,
        rejected = summary.rejected,
        "source finished"
    );
    SourceOutcome {
        summary,
        records,
        rejected,
    }
}

/// Keep the last record seen per key; returns the survivors in key order and the
/// number dropped.
fn collapse_duplicates(records: Vec<NormalizedRecord>) -> (Vec<NormalizedRecord>, usize) {
    let total = records.len();
    let mut by_key: BTreeMap<RecordKey, NormalizedRecord> = BTreeMap::new();
    for record in records {
        by_key.insert(record.key(), record);
    }
    let dropped = total - by_key.len();
    (by_key.into_values().collect(), dropped)
}

pub struct SyncPipeline {
    http: Arc<HttpFetcher>,
    normalizer: Arc<Normalizer>,
    dedup: Option<DedupEngine>,
    writer: Option<ShardWriter>,
    staging: Option<Arc<dyn StagingBackend>>,
    reports_dir: Option<PathBuf>,
    max_pages: usize,
}

impl SyncPipeline {
    pub fn new(http: Arc<HttpFetcher>, normalizer: Arc<Normalizer>) -> Self {
        Self {
            http,
            normalizer,
            dedup: Some(DedupEngine::new(DedupConfig::default())),
            writer: None,
            staging: None,
            reports_dir: None,
            max_pages: 50,
        }
    }

    /// `None` turns clustering off: every record becomes its own cluster.
    pub fn with_dedup(mut self, config: Option<DedupConfig>) -> Self {
        self.dedup = config.map(DedupEngine::new);
        self
    }

    pub fn with_writer(mut self, writer: ShardWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_staging(mut self, backend: Arc<dyn StagingBackend>) -> Self {
        self.staging = Some(backend);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub async fn run(
        &self,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        if self.writer.is_none() && self.staging.is_none() {
            anyhow::bail!("no output target configured: set an output directory or a staging database");
        }
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ctx = AdapterContext::new(run_id).with_cancel(cancel.clone());
        info!(%run_id, sources = adapters.len(), "sync run started");

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let source_id = adapter.source_id().to_string();
            let span = info_span!("source_sync", source_id = %source_id, %run_id);
            let task = crawl_source(
                adapter,
                self.http.clone(),
                self.normalizer.clone(),
                ctx.clone(),
                self.max_pages,
                cancel.clone(),
            )
            .instrument(span);
            handles.push((source_id, tokio::spawn(task)));
        }

        let mut sources = Vec::with_capacity(handles.len());
        let mut all_records = Vec::new();
        let mut rejected_records = Vec::new();
        for (source_id, handle) in handles {
            match handle.await {
                Ok(outcome) => {
                    sources.push(outcome.summary);
                    all_records.extend(outcome.records);
                    rejected_records.extend(outcome.rejected);
                }
                Err(err) => {
                    warn!(source_id = %source_id, error = %err, "source task aborted");
                    sources.push(SourceSummary {
                        source_id,
                        status: SourceStatus::Failed,
                        pages: 0,
                        fetched: 0,
                        normalized: 0,
                        rejected: 0,
                        errors: vec![format!("source task aborted: {err}")],
                        circuit: CircuitState::Closed,
                    });
                }
            }
        }

        let (records, duplicates_dropped) = collapse_duplicates(all_records);
        if duplicates_dropped > 0 {
            warn!(duplicates_dropped, "dropped records repeated under the same key");
        }

        let (clusters, review, dedupe, dedupe_error) = match &self.dedup {
            Some(engine) => match engine.cluster(&records) {
                Ok(outcome) => (outcome.clusters, outcome.review, DedupeMode::Enabled, None),
                Err(err) => {
                    warn!(error = %err, "dedupe failed, falling back to singleton clusters");
                    (
                        dedup::singleton_clusters(&records),
                        Vec::new(),
                        DedupeMode::Fallback,
                        Some(err.to_string()),
                    )
                }
            },
            None => (
                dedup::singleton_clusters(&records),
                Vec::new(),
                DedupeMode::Disabled,
                None,
            ),
        };

        let output = match &self.writer {
            Some(writer) => {
                let written = writer
                    .write(&clusters)
                    .await
                    .with_context(|| format!("writing shards to {}", writer.root().display()))?;
                Some(OutputSummary {
                    root: written.root.display().to_string(),
                    manifest: written.manifest_path.display().to_string(),
                    shards: written.manifest.shards.len(),
                    entities: written.manifest.total_entities,
                })
            }
            None => None,
        };

        let staging = match &self.staging {
            Some(backend) => Some(
                backend
                    .stage(run_id, &clusters)
                    .await
                    .with_context(|| format!("staging run {run_id} via {}", backend.name()))?,
            ),
            None => None,
        };

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled: cancel.is_cancelled(),
            fetched: sources.iter().map(|s| s.fetched).sum(),
            normalized: sources.iter().map(|s| s.normalized).sum(),
            rejected: rejected_records.len(),
            duplicates_dropped,
            clustered_records: clusters.iter().map(|c| c.members.len()).sum(),
            clusters: clusters.len(),
            merged_clusters: clusters.iter().filter(|c| c.members.len() > 1).count(),
            review_candidates: review.len(),
            dedupe,
            dedupe_error,
            rejected_records,
            output,
            staging,
            reports_dir: None,
            sources,
        };

        if let Some(dir) = &self.reports_dir {
            let run_dir = write_reports(dir, &summary).await?;
            summary.reports_dir = Some(run_dir.display().to_string());
        }

        info!(
            %run_id,
            clusters = summary.clusters,
            normalized = summary.normalized,
            rejected = summary.rejected,
            failed_sources = summary.failed_sources(),
            "sync run finished"
        );
        Ok(RunResult {
            summary,
            clusters,
            review,
        })
    }
}

pub fn render_run_brief(summary: &RunSummary) -> String {
    let source_lines = summary
        .sources
        .iter()
        .map(|s| {
            let mut line = format!(
                "- {}: {:?}, pages {}, fetched {}, normalized {}, rejected {}, circuit {:?}",
                s.source_id, s.status, s.pages, s.fetched, s.normalized, s.rejected, s.circuit
            );
            for err in &s.errors {
                line.push_str(&format!("\n  - error: {err}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Catalog Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Cancelled: {}\n- Fetched: {}\n- Normalized: {}\n- Rejected: {}\n- Duplicates dropped: {}\n- Clusters: {} ({} merged)\n- Review candidates: {}\n- Dedupe: {:?}\n\n## Sources\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.cancelled,
        summary.fetched,
        summary.normalized,
        summary.rejected,
        summary.duplicates_dropped,
        summary.clusters,
        summary.merged_clusters,
        summary.review_candidates,
        summary.dedupe,
        source_lines
    )
}

async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(run_dir.join("run_brief.md"), render_run_brief(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(run_dir)
}

/// Build every enabled adapter. A source that cannot be constructed is a
/// configuration error for the whole run.
pub fn build_adapters(
    registry: &SourceRegistry,
    workspace_root: &Path,
) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    registry
        .enabled()
        .map(|source| {
            adapter_for_source(&source.adapter_settings(), workspace_root)
                .with_context(|| format!("configuring source `{}`", source.source_id))
        })
        .collect()
}

pub async fn run_sync(config: &SyncConfig, cancel: CancellationToken) -> Result<RunResult> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let rules = NormalizationRules::from_workspace_root(&config.workspace_root)?;
    let normalizer = Normalizer::new(rules)?;
    let http = HttpFetcher::new(config.http_config(&registry))?;
    let adapters = build_adapters(&registry, &config.workspace_root)?;

    let dedup = if config.dedupe {
        Some(config.dedup_config()?)
    } else {
        None
    };
    let mut pipeline = SyncPipeline::new(Arc::new(http), Arc::new(normalizer))
        .with_dedup(dedup)
        .with_max_pages(config.max_pages)
        .with_reports_dir(&config.reports_dir);
    if let Some(dir) = &config.output_dir {
        pipeline = pipeline.with_writer(ShardWriter::new(dir));
    }
    if let Some(url) = &config.database_url {
        let backend = PgStagingBackend::connect(url).await?;
        pipeline = pipeline.with_staging(Arc::new(backend));
    }
    pipeline.run(adapters, cancel).await
}

pub async fn run_sync_once_from_env() -> Result<RunResult> {
    run_sync(&SyncConfig::from_env()?, CancellationToken::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catalog_adapters::{AdapterError, FixtureAdapter, FixtureBundle, FixturePage, FixtureRecord, Page};
    use catalog_core::RawRecord;
    use catalog_storage::ScriptedTransport;
    use serde_json::{json, Value as JsonValue};

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::with_transport(
            HttpClientConfig::default(),
            Arc::new(ScriptedTransport::new()),
        ))
    }

    fn pipeline() -> SyncPipeline {
        SyncPipeline::new(fetcher(), Arc::new(Normalizer::builtin().unwrap()))
    }

    fn fixture_record(id: &str, payload: JsonValue) -> FixtureRecord {
        FixtureRecord {
            source_native_id: id.to_string(),
            source_url: None,
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    fn fixture(source: &str, pages: Vec<Vec<FixtureRecord>>) -> Arc<dyn SourceAdapter> {
        Arc::new(FixtureAdapter::new(
            source,
            FixtureBundle {
                source_id: source.to_string(),
                captured_from_url: None,
                notes: None,
                pages: pages
                    .into_iter()
                    .map(|records| FixturePage { records })
                    .collect(),
            },
        ))
    }

    struct BrokenAdapter;

    #[async_trait]
    impl SourceAdapter for BrokenAdapter {
        fn source_id(&self) -> &str {
            "xbox"
        }

        fn crawlability(&self) -> Crawlability {
            Crawlability::Api
        }

        async fn fetch_page(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            _cursor: Option<&str>,
        ) -> Result<Page, AdapterError> {
            Err(AdapterError::Message("store unreachable".to_string()))
        }
    }

    /// Serves one page, then cancels the run while advertising another page.
    struct CancellingAdapter {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl SourceAdapter for CancellingAdapter {
        fn source_id(&self) -> &str {
            "psn"
        }

        fn crawlability(&self) -> Crawlability {
            Crawlability::Api
        }

        async fn fetch_page(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            cursor: Option<&str>,
        ) -> Result<Page, AdapterError> {
            assert!(cursor.is_none(), "no page is requested after cancellation");
            self.cancel.cancel();
            let payload = json!({"name": "Halo Drift"}).as_object().cloned().unwrap();
            Ok(Page {
                records: vec![RawRecord::new("psn", "EP0001", payload)],
                next_cursor: Some("1".to_string()),
            })
        }
    }

    fn steam_pages() -> Vec<Vec<FixtureRecord>> {
        vec![
            vec![
                fixture_record(
                    "10",
                    json!({"name": "Super Game: Deluxe Edition", "publishers": ["Acme"], "release_date": {"date": "2020"}}),
                ),
                fixture_record("11", json!({"name": "   "})),
            ],
            vec![fixture_record("12", json!({"name": "Zephyr Tactics", "is_free": true}))],
        ]
    }

    fn psn_pages() -> Vec<Vec<FixtureRecord>> {
        vec![vec![fixture_record(
            "UP0001",
            json!({"name": "Super Game", "publisherName": "Acme Inc", "releaseDate": "2020-06-01"}),
        )]]
    }

    #[tokio::test]
    async fn failing_source_does_not_block_the_others() {
        let out = tempfile::tempdir().unwrap();
        let result = pipeline()
            .with_writer(ShardWriter::new(out.path()))
            .run(
                vec![
                    fixture("steam", steam_pages()),
                    Arc::new(BrokenAdapter) as Arc<dyn SourceAdapter>,
                    fixture("psn", psn_pages()),
                ],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let summary = &result.summary;
        assert_eq!(summary.sources.len(), 3);
        assert_eq!(summary.sources[1].status, SourceStatus::Failed);
        assert_eq!(summary.sources[1].errors, vec!["store unreachable".to_string()]);
        assert_eq!(summary.failed_sources(), 1);
        assert_eq!(summary.sources[0].pages, 2);
        assert_eq!(summary.fetched, 4);
        assert_eq!(summary.normalized, 3);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.rejected_records[0].source_native_id, "11");

        // Super Game from steam and psn merge; Zephyr stays alone.
        assert_eq!(summary.dedupe, DedupeMode::Enabled);
        assert_eq!(summary.clusters, 2);
        assert_eq!(summary.merged_clusters, 1);
        assert!(out.path().join("s.json").exists());
        assert!(out.path().join("!.json").exists());
        assert_eq!(summary.output.as_ref().map(|o| o.shards), Some(27));
    }

    #[tokio::test]
    async fn cancellation_keeps_already_normalized_records() {
        let cancel = CancellationToken::new();
        let staging = Arc::new(MemoryStagingBackend::new());
        let result = pipeline()
            .with_staging(staging.clone())
            .run(
                vec![Arc::new(CancellingAdapter {
                    cancel: cancel.clone(),
                }) as Arc<dyn SourceAdapter>],
                cancel,
            )
            .await
            .unwrap();

        assert!(result.summary.cancelled);
        assert_eq!(result.summary.sources[0].status, SourceStatus::Cancelled);
        assert_eq!(result.summary.sources[0].pages, 1);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(staging.record_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_short_a_retrying_source() {
        let transport = Arc::new(ScriptedTransport::new());
        let http = Arc::new(HttpFetcher::with_transport(
            HttpClientConfig {
                default_policy: SourcePolicy {
                    concurrency: 1,
                    token_bucket: None,
                    backoff: BackoffPolicy {
                        max_retries: 5,
                        base_delay: Duration::from_secs(1),
                        max_delay: Duration::from_secs(30),
                        jitter: 0.0,
                    },
                    circuit: CircuitBreakerConfig {
                        failure_threshold: 10,
                        cooldown: Duration::from_secs(30),
                    },
                },
                ..HttpClientConfig::default()
            },
            transport.clone(),
        ));
        let pipeline = SyncPipeline::new(http, Arc::new(Normalizer::builtin().unwrap()))
            .with_staging(Arc::new(MemoryStagingBackend::new()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let adapter = catalog_adapters::steam_adapter(catalog_adapters::STEAM_LISTING_URL, 50);
        let result = pipeline
            .run(vec![Arc::new(adapter) as Arc<dyn SourceAdapter>], cancel)
            .await
            .unwrap();

        let source = &result.summary.sources[0];
        assert!(result.summary.cancelled);
        assert_eq!(source.status, SourceStatus::Cancelled);
        assert!(source.errors.is_empty());
        assert_eq!(source.pages, 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn page_limit_stops_pagination() {
        let staging = Arc::new(MemoryStagingBackend::new());
        let result = pipeline()
            .with_staging(staging)
            .with_max_pages(1)
            .run(vec![fixture("steam", steam_pages())], CancellationToken::new())
            .await
            .unwrap();
        let source = &result.summary.sources[0];
        assert_eq!(source.status, SourceStatus::PageLimit);
        assert_eq!(source.pages, 1);
        assert_eq!(source.fetched, 2);
    }

    #[tokio::test]
    async fn disabled_dedupe_yields_singletons() {
        let staging = Arc::new(MemoryStagingBackend::new());
        let result = pipeline()
            .with_dedup(None)
            .with_staging(staging.clone())
            .run(
                vec![fixture("steam", steam_pages()), fixture("psn", psn_pages())],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.summary.dedupe, DedupeMode::Disabled);
        assert_eq!(result.summary.clusters, 3);
        assert!(result.clusters.iter().all(|c| c.members.len() == 1));
        assert_eq!(staging.cluster_ids().await.len(), 3);
    }

    #[tokio::test]
    async fn rejected_dedupe_settings_fall_back_to_singletons() {
        let out = tempfile::tempdir().unwrap();
        let result = pipeline()
            .with_dedup(Some(DedupConfig {
                review_threshold: 0.99,
                ..DedupConfig::default()
            }))
            .with_writer(ShardWriter::new(out.path()))
            .run(
                vec![fixture("steam", steam_pages()), fixture("psn", psn_pages())],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let summary = &result.summary;
        assert_eq!(summary.dedupe, DedupeMode::Fallback);
        assert!(summary
            .dedupe_error
            .as_deref()
            .is_some_and(|e| e.contains("review threshold")));
        assert_eq!(summary.clusters, 3);
        assert_eq!(summary.merged_clusters, 0);
        assert!(result.clusters.iter().all(|c| c.members.len() == 1));
        assert!(result.review.is_empty());
        assert!(out.path().join("s.json").exists());
        assert_eq!(summary.output.as_ref().map(|o| o.shards), Some(27));
    }

    #[tokio::test]
    async fn repeated_keys_are_collapsed_before_clustering() {
        let staging = Arc::new(MemoryStagingBackend::new());
        let pages = vec![
            vec![fixture_record("10", json!({"name": "Old Title"}))],
            vec![fixture_record("10", json!({"name": "Orbit Runner"}))],
        ];
        let result = pipeline()
            .with_staging(staging)
            .run(vec![fixture("steam", pages)], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.summary.duplicates_dropped, 1);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].canonical.title, "Orbit Runner");
    }

    #[tokio::test]
    async fn missing_output_target_is_a_configuration_error() {
        let err = pipeline()
            .run(vec![fixture("steam", steam_pages())], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no output target"));
    }

    #[tokio::test]
    async fn staging_failure_aborts_the_run() {
        let err = pipeline()
            .with_staging(Arc::new(MemoryStagingBackend::failing("connection refused")))
            .run(vec![fixture("psn", psn_pages())], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
    }

    #[tokio::test]
    async fn reports_are_written_per_run() {
        let reports = tempfile::tempdir().unwrap();
        let result = pipeline()
            .with_staging(Arc::new(MemoryStagingBackend::new()))
            .with_reports_dir(reports.path())
            .run(vec![fixture("psn", psn_pages())], CancellationToken::new())
            .await
            .unwrap();
        let run_dir = reports.path().join(result.summary.run_id.to_string());
        let brief = std::fs::read_to_string(run_dir.join("run_brief.md")).unwrap();
        assert!(brief.contains("# Catalog Sync Brief"));
        assert!(brief.contains("- psn: Completed"));
        let json: JsonValue =
            serde_json::from_slice(&std::fs::read(run_dir.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(json["clusters"], json!(1));
        assert_eq!(json["sources"][0]["circuit"], json!("closed"));
    }

    #[test]
    fn registry_parses_policies_and_rejects_unknown_crawlability() {
        let registry = SourceRegistry::from_yaml(
            r#"
sources:
  - source_id: steam
    display_name: Steam
    enabled: true
    crawlability: api
    page_size: 25
    rate_limit: { capacity: 2, refill_every_ms: 500 }
    retry: { max_retries: 5, base_delay_ms: 100, max_delay_ms: 2000 }
    circuit: { failure_threshold: 3, cooldown_secs: 60 }
  - source_id: psn
    display_name: PlayStation Store
    enabled: false
    crawlability: fixture
"#,
        )
        .unwrap();
        assert_eq!(registry.enabled().count(), 1);

        let steam = &registry.sources[0];
        assert_eq!(steam.adapter_settings().page_size, 25);
        let policy = steam.policy(SourcePolicy::default());
        assert_eq!(policy.backoff.max_retries, 5);
        assert_eq!(policy.circuit.failure_threshold, 3);
        assert_eq!(policy.circuit.cooldown, Duration::from_secs(60));
        assert_eq!(
            policy.token_bucket.map(|b| b.refill_every),
            Some(Duration::from_millis(500))
        );

        let bad = SourceRegistry::from_yaml(
            "sources:\n  - source_id: x\n    display_name: X\n    enabled: true\n    crawlability: telepathy\n",
        );
        assert!(bad.is_err());
    }

    #[test]
    fn malformed_settings_are_reported_by_name() {
        assert!(parse_flag("CATALOG_DEDUPE", None, true).unwrap());
        assert!(parse_flag("CATALOG_DEDUPE", Some("  "), true).unwrap());
        assert!(!parse_flag("CATALOG_DEDUPE", Some("Off"), true).unwrap());
        assert!(parse_flag("CATALOG_DEDUPE", Some("YES"), false).unwrap());
        let err = parse_flag("CATALOG_DEDUPE", Some("maybe"), true).unwrap_err();
        assert!(err.to_string().contains("CATALOG_DEDUPE"));

        assert_eq!(parse_setting("CATALOG_MAX_PAGES", Some(" 7 "), 50usize).unwrap(), 7);
        assert_eq!(parse_setting("CATALOG_MAX_PAGES", None, 50usize).unwrap(), 50);
        let err = parse_setting("CATALOG_MAX_PAGES", Some("ten"), 50usize).unwrap_err();
        assert!(err.to_string().contains("CATALOG_MAX_PAGES"));
        assert!(parse_setting("CATALOG_MERGE_THRESHOLD", Some("0,9"), 0.85f64).is_err());
    }

    #[test]
    fn dedup_config_follows_merge_threshold() {
        let mut config = SyncConfig::from_env().unwrap();
        config.merge_threshold = 0.7;
        let dedup = config.dedup_config().unwrap();
        assert_eq!(dedup.merge_threshold, 0.7);
        assert_eq!(dedup.review_threshold, 0.7);

        config.merge_threshold = 1.5;
        assert!(config.dedup_config().is_err());
    }
}
