//! Collection pipeline: source registry, per-source scrape, normalization, classification,
//! storage, and the cron trigger around it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use phdc_adapters::{extractor_for_source, ListingTarget, PagingScheme, ScrapePlan, SourceExtractor};
use phdc_core::CollectionStats;
use phdc_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, PageFetcher, Repository, BROWSER_USER_AGENT,
};
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod classify;
mod normalize;

pub use classify::{Classifier, KeywordRule, KeywordTable};
pub use normalize::{normalize, strip_tracking, TRACKING_MARKER};

const BUILTIN_SOURCES: &str = include_str!("../../../sources.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
    pub max_pages: u32,
    pub paging: PagingScheme,
    #[serde(default)]
    pub targets: Vec<ListingTarget>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn plan(&self) -> ScrapePlan {
        ScrapePlan {
            base_url: self.base_url.clone(),
            targets: self.targets.clone(),
            paging: self.paging.clone(),
            max_pages: self.max_pages,
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_SOURCES)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `sources.yaml` under the workspace root when present, the built-in registry otherwise.
    pub async fn for_workspace(root: &Path) -> Result<Self> {
        let path = root.join("sources.yaml");
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Self::load(&path).await
        } else {
            Self::builtin()
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Extractors for every enabled source, in registry order.
    pub fn build_extractors(&self) -> Result<Vec<Box<dyn SourceExtractor>>> {
        self.enabled()
            .map(|source| {
                extractor_for_source(&source.source_id, source.plan())
                    .with_context(|| format!("configuring extractor for {}", source.source_id))?
                    .with_context(|| format!("no extractor registered for {}", source.source_id))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub max_attempts: u32,
    pub user_agent: String,
    pub schedule_cron: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_or = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/phd_projects.db".to_string()),
            http_timeout_secs: parse_or("PHDC_HTTP_TIMEOUT_SECS", 30),
            request_delay_ms: parse_or("PHDC_REQUEST_DELAY_MS", 2000),
            max_attempts: lookup("PHDC_MAX_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3),
            user_agent: lookup("PHDC_USER_AGENT").unwrap_or_else(|| BROWSER_USER_AGENT.to_string()),
            schedule_cron: lookup("PHDC_SCHEDULE_CRON").unwrap_or_else(|| "0 0 8 * * *".to_string()),
            workspace_root: lookup("PHDC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            request_delay: Duration::from_millis(self.request_delay_ms),
            max_attempts: self.max_attempts,
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Serializes collection runs; a trigger that finds a run in progress is skipped.
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    inner: Arc<Mutex<()>>,
}

impl RunLock {
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

pub struct Collector {
    extractors: Vec<Box<dyn SourceExtractor>>,
    http: Box<dyn PageFetcher>,
    repository: Repository,
    classifier: Classifier,
}

impl Collector {
    pub fn new(
        extractors: Vec<Box<dyn SourceExtractor>>,
        http: Box<dyn PageFetcher>,
        repository: Repository,
        classifier: Classifier,
    ) -> Self {
        Self {
            extractors,
            http,
            repository,
            classifier,
        }
    }

    /// Wire registry, HTTP client, store and rules from configuration. Any failure here is fatal.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::for_workspace(&config.workspace_root).await?;
        let extractors = registry.build_extractors()?;
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let repository = Repository::connect(&config.database_url).await?;
        repository.migrate().await.context("running migrations")?;
        let classifier = Classifier::for_workspace(&config.workspace_root)?;
        Ok(Self::new(extractors, Box::new(http), repository, classifier))
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// One pass over every source. Per-source failures are counted, never propagated.
    pub async fn run(&self) -> CollectionStats {
        let run_id = Uuid::new_v4();
        let span = info_span!("collection_run", %run_id);
        async {
            info!(sources = self.extractors.len(), "collection started");
            let mut stats = CollectionStats::default();
            for extractor in &self.extractors {
                let source = extractor.source_id();
                self.collect_source(extractor.as_ref(), &mut stats)
                    .instrument(info_span!("collect_source", source))
                    .await;
            }
            info!(%stats, "collection finished");
            stats
        }
        .instrument(span)
        .await
    }

    /// Run unless another run holds `lock`; `None` means the trigger was skipped.
    pub async fn run_exclusive(&self, lock: &RunLock) -> Option<CollectionStats> {
        let Some(_guard) = lock.try_acquire() else {
            warn!("collection already in progress, trigger skipped");
            return None;
        };
        Some(self.run().await)
    }

    async fn collect_source(&self, extractor: &dyn SourceExtractor, stats: &mut CollectionStats) {
        let scraped = match extractor.scrape(self.http.as_ref()).await {
            Ok(candidates) => candidates,
            Err(err) => {
                stats.errors += 1;
                error!(source = extractor.source_id(), error = %err, "source failed");
                return;
            }
        };
        stats.total_scraped += scraped.len();

        let mut candidates = normalize(scraped);
        for candidate in &mut candidates {
            self.classifier.enrich(candidate);
        }

        let outcome = self.repository.upsert(&candidates).await;
        if outcome.rolled_back {
            stats.storage_failures += 1;
        }
        stats.new_saved += outcome.inserted;
        stats.duplicates += outcome.merged;
        info!(
            kept = candidates.len(),
            inserted = outcome.inserted,
            merged = outcome.merged,
            "source stored"
        );
    }
}

/// Cron-triggered collection; overlapping triggers are skipped through `lock`.
pub async fn build_scheduler(
    cron: &str,
    collector: Arc<Collector>,
    lock: RunLock,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let collector = Arc::clone(&collector);
        let lock = lock.clone();
        Box::pin(async move {
            if let Some(stats) = collector.run_exclusive(&lock).await {
                info!(%stats, "scheduled collection complete");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_collection_from_env() -> Result<CollectionStats> {
    let config = SyncConfig::from_env();
    let collector = Collector::from_config(&config).await?;
    Ok(collector.run().await)
}
