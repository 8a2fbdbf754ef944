//! One run of one source: paginate, map, batch, persist, close.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use homepedia_adapters::SourceAdapter;
use homepedia_core::{RunStatistics, TerminationReason};
use homepedia_storage::{
    HttpFetcher, MemoryPropertyStore, PgPropertyStore, PgStoreConfig, PropertyStore, StoreError,
    UpsertOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::accumulator::BatchAccumulator;
use crate::closer::{LifecycleCloser, RunContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Paginating,
    Flushing,
    Closing,
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub total_properties: u64,
    pub new_properties: u64,
    pub updated_properties: u64,
    pub failed_writes: u64,
    pub rejected_records: u64,
    pub total_pages: u64,
}

impl RunCounters {
    pub fn absorb(&mut self, outcome: &UpsertOutcome) {
        self.total_properties += outcome.succeeded();
        self.new_properties += outcome.inserted;
        self.updated_properties += outcome.updated;
        self.failed_writes += outcome.failures.len() as u64;
    }

    pub fn statistics(&self, run: RunContext, finished_at: DateTime<Utc>) -> RunStatistics {
        let duration_seconds = (finished_at - run.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let properties_per_page = if self.total_pages > 0 {
            self.total_properties as f64 / self.total_pages as f64
        } else {
            0.0
        };
        let time_per_property = if self.total_properties > 0 {
            duration_seconds / self.total_properties as f64
        } else {
            0.0
        };
        RunStatistics {
            run_id: run.run_id,
            source: run.source,
            started_at: run.started_at,
            finished_at,
            duration_seconds,
            total_properties: self.total_properties,
            new_properties: self.new_properties,
            updated_properties: self.updated_properties,
            failed_writes: self.failed_writes,
            rejected_records: self.rejected_records,
            total_pages: self.total_pages,
            properties_per_page,
            time_per_property,
            incomplete_departments: run.incomplete_departments,
            reason: run.reason,
        }
    }
}

/// Where a run writes to.
#[derive(Debug, Clone)]
pub enum StoreTarget {
    Postgres {
        database_url: String,
        config: PgStoreConfig,
        migrate: bool,
    },
    Memory(MemoryPropertyStore),
}

impl StoreTarget {
    pub async fn open(&self) -> Result<Arc<dyn PropertyStore>, StoreError> {
        match self {
            StoreTarget::Postgres {
                database_url,
                config,
                migrate,
            } => {
                let store = PgPropertyStore::connect(database_url, config).await?;
                if *migrate {
                    store.migrate().await?;
                }
                Ok(Arc::new(store))
            }
            StoreTarget::Memory(store) => Ok(Arc::new(store.session())),
        }
    }
}

pub struct Pipeline {
    adapter: Box<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    batch_size: usize,
    closer: LifecycleCloser,
    shutdown: CancellationToken,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        http: Arc<HttpFetcher>,
        batch_size: usize,
        stale_after: chrono::Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            http,
            batch_size,
            closer: LifecycleCloser::new(stale_after),
            shutdown,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(source = %self.adapter.source(), from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
    }

    /// Runs to exhaustion, failure or shutdown. Only a store that cannot be
    /// opened is returned as an error; every other outcome is in the statistics.
    pub async fn run(&mut self, target: &StoreTarget) -> Result<RunStatistics, StoreError> {
        let run_id = Uuid::new_v4();
        let source = self.adapter.source();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, %source);

        async move {
            let store = target.open().await?;
            self.transition(PipelineState::Running);
            info!("run started");

            let mut accumulator = BatchAccumulator::new(self.batch_size, self.shutdown.clone());
            let mut counters = RunCounters::default();
            let reason = self
                .drive(store.as_ref(), &mut accumulator, &mut counters)
                .await;

            self.transition(PipelineState::Closing);
            let run = RunContext {
                run_id,
                source,
                started_at,
                reason,
                incomplete_departments: self.adapter.pagination().incomplete_departments.clone(),
            };
            let stats = self
                .closer
                .close(store.as_ref(), &mut accumulator, &mut counters, run)
                .await;
            self.transition(PipelineState::Terminated);
            info!(reason = %stats.reason, "run finished");
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &mut self,
        store: &dyn PropertyStore,
        accumulator: &mut BatchAccumulator,
        counters: &mut RunCounters,
    ) -> TerminationReason {
        loop {
            if self.shutdown.is_cancelled() {
                return TerminationReason::Shutdown;
            }
            self.transition(PipelineState::Paginating);

            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return TerminationReason::Shutdown,
                next = self.adapter.next_page(&self.http) => next,
            };
            let page = match next {
                Ok(Some(page)) => page,
                Ok(None) => return TerminationReason::Finished,
                Err(err) => {
                    error!(error = %err, "adapter failed");
                    return TerminationReason::AdapterFailure;
                }
            };

            counters.total_pages += 1;
            let department = page.context.department.clone().unwrap_or_default();
            debug!(%department, page = page.context.page, records = page.records.len(), "page fetched");

            let seen_at = Utc::now();
            for listing in page.records {
                if self.shutdown.is_cancelled() {
                    return TerminationReason::Shutdown;
                }
                match self.adapter.map_record(listing, &page.context, seen_at) {
                    Ok(property) => accumulator.add(property),
                    Err(rejection) => {
                        counters.rejected_records += 1;
                        warn!(%department, page = page.context.page, %rejection, "record rejected");
                    }
                }

                if accumulator.should_flush() {
                    self.transition(PipelineState::Flushing);
                    match accumulator.flush(store).await {
                        Ok(outcome) => counters.absorb(&outcome),
                        Err(err) => {
                            error!(error = %err, "store unavailable");
                            return TerminationReason::StoreFailure;
                        }
                    }
                    self.transition(PipelineState::Paginating);
                }
            }
        }
    }
}
