//! Sync pipeline orchestration.

pub mod accumulator;
pub mod closer;
pub mod config;
pub mod pipeline;

use std::sync::Arc;

use anyhow::{Context, Result};
use homepedia_adapters::{adapter_for_source, SourceConfig};
use homepedia_core::{RunStatistics, Source, TerminationReason};
use homepedia_storage::{HttpFetcher, StoreError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use accumulator::BatchAccumulator;
pub use closer::{LifecycleCloser, RunContext};
pub use config::{SourceRegistry, SyncConfig};
pub use pipeline::{Pipeline, PipelineState, RunCounters, StoreTarget};

pub const CRATE_NAME: &str = "homepedia-sync";

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Only these sources. Empty means every enabled source.
    pub sources: Vec<Source>,
    pub parallel: bool,
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub runs: Vec<RunStatistics>,
}

impl SyncRunSummary {
    pub fn store_failed(&self) -> bool {
        self.runs
            .iter()
            .any(|r| r.reason == TerminationReason::StoreFailure)
    }
}

fn selected<'a>(registry: &'a SourceRegistry, options: &SyncOptions) -> Vec<&'a SourceConfig> {
    registry
        .enabled()
        .filter(|s| options.sources.is_empty() || options.sources.contains(&s.source))
        .collect()
}

type RunTask = (Source, Result<RunStatistics, StoreError>);

/// Waits for every task before reporting the first failure, so siblings reach
/// their own close instead of being aborted with the set.
async fn drain_runs(mut tasks: JoinSet<RunTask>) -> Result<Vec<RunStatistics>> {
    let mut runs = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .context("sync task panicked")
            .and_then(|(source, result)| {
                result.with_context(|| format!("opening store for {source}"))
            });
        match outcome {
            Ok(stats) => runs.push(stats),
            Err(err) => {
                error!(error = %format!("{err:#}"), "sync task failed");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(runs),
    }
}

/// Runs every selected source, one after the other unless `parallel` is set.
pub async fn run_sources(
    config: &SyncConfig,
    registry: &SourceRegistry,
    target: &StoreTarget,
    options: &SyncOptions,
    shutdown: CancellationToken,
) -> Result<SyncRunSummary> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let sources = selected(registry, options);
    info!(sources = sources.len(), parallel = options.parallel, "sync starting");

    let mut pipelines = Vec::with_capacity(sources.len());
    for source in sources {
        let adapter = adapter_for_source(source, config.pagination_limits())
            .with_context(|| format!("building adapter for {}", source.source))?;
        pipelines.push((
            source.source,
            Pipeline::new(
                adapter,
                http.clone(),
                config.batch_size,
                config.stale_after(),
                shutdown.clone(),
            ),
        ));
    }

    let runs = if options.parallel {
        let mut tasks = JoinSet::new();
        for (source, mut pipeline) in pipelines {
            let target = target.clone();
            tasks.spawn(async move { (source, pipeline.run(&target).await) });
        }
        drain_runs(tasks).await?
    } else {
        let mut runs = Vec::with_capacity(pipelines.len());
        for (source, mut pipeline) in pipelines {
            if shutdown.is_cancelled() {
                info!(%source, "shutdown requested, not starting source");
                continue;
            }
            let stats = pipeline
                .run(target)
                .await
                .with_context(|| format!("opening store for {source}"))?;
            runs.push(stats);
        }
        runs
    };

    Ok(SyncRunSummary { runs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use homepedia_storage::MemoryPropertyStore;

    fn registry() -> SourceRegistry {
        SourceRegistry::from_yaml(
            r#"
sources:
  - source: dvf
    display_name: DVF
    enabled: true
    base_url: https://files.data.gouv.fr/geo-dvf/latest/csv
  - source: bienici
    display_name: Bien'ici
    enabled: false
    base_url: https://www.bienici.com/realEstateAds.json
    suggest_url: https://res.bienici.com/suggest.json
  - source: seloger
    display_name: SeLoger
    enabled: true
    base_url: https://www.seloger.com/immobilier/achat
"#,
        )
        .expect("registry")
    }

    #[test]
    fn source_filter_applies_on_top_of_enabled_flag() {
        let registry = registry();
        let all: Vec<Source> = selected(&registry, &SyncOptions::default())
            .iter()
            .map(|s| s.source)
            .collect();
        assert_eq!(all, vec![Source::Dvf, Source::Seloger]);

        let options = SyncOptions {
            sources: vec![Source::Seloger, Source::Bienici],
            parallel: false,
        };
        let only: Vec<Source> = selected(&registry, &options).iter().map(|s| s.source).collect();
        assert_eq!(only, vec![Source::Seloger]);
    }

    #[tokio::test]
    async fn dvf_without_years_finishes_immediately() {
        let registry = registry();
        let store = MemoryPropertyStore::new();
        let options = SyncOptions {
            sources: vec![Source::Dvf],
            parallel: true,
        };

        let summary = run_sources(
            &SyncConfig::from_env(),
            &registry,
            &StoreTarget::Memory(store.clone()),
            &options,
            CancellationToken::new(),
        )
        .await
        .expect("sync");

        assert_eq!(summary.runs.len(), 1);
        assert_eq!(summary.runs[0].reason, TerminationReason::Finished);
        assert!(!summary.store_failed());
        assert_eq!(store.runs().await.len(), 1);
    }

    fn finished_run(source: Source) -> RunStatistics {
        let now = chrono::Utc::now();
        RunStatistics {
            run_id: uuid::Uuid::new_v4(),
            source,
            started_at: now,
            finished_at: now,
            duration_seconds: 0.0,
            total_properties: 0,
            new_properties: 0,
            updated_properties: 0,
            failed_writes: 0,
            rejected_records: 0,
            total_pages: 0,
            properties_per_page: 0.0,
            time_per_property: 0.0,
            incomplete_departments: Vec::new(),
            reason: TerminationReason::Finished,
        }
    }

    #[tokio::test]
    async fn failed_store_open_waits_for_sibling_runs() {
        let sibling_closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut tasks: JoinSet<RunTask> = JoinSet::new();
        tasks.spawn(async { (Source::Seloger, Err(StoreError::Closed)) });
        let flag = sibling_closed.clone();
        tasks.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            (Source::Bienici, Ok(finished_run(Source::Bienici)))
        });

        let err = drain_runs(tasks).await.expect_err("store open failed");

        assert!(format!("{err:#}").contains("opening store for seloger"));
        assert!(sibling_closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_sync_starts_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let summary = run_sources(
            &SyncConfig::from_env(),
            &registry(),
            &StoreTarget::Memory(MemoryPropertyStore::new()),
            &SyncOptions::default(),
            token,
        )
        .await
        .expect("sync");
        assert!(summary.runs.is_empty());
    }
}
