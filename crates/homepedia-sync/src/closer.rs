//! End-of-run reconciliation.

use chrono::{DateTime, Utc};
use homepedia_core::{RunStatistics, Source, TerminationReason};
use homepedia_storage::PropertyStore;
use tracing::{error, info};
use uuid::Uuid;

use crate::accumulator::BatchAccumulator;
use crate::pipeline::RunCounters;

/// Identity of the run being closed.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub source: Source,
    pub started_at: DateTime<Utc>,
    pub reason: TerminationReason,
    pub incomplete_departments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LifecycleCloser {
    stale_after: chrono::Duration,
}

impl LifecycleCloser {
    pub fn new(stale_after: chrono::Duration) -> Self {
        Self { stale_after }
    }

    /// Flushes, sweeps stale rows, deduplicates, records the run and releases
    /// the store. A failing step is logged and the next one still runs.
    pub async fn close(
        &self,
        store: &dyn PropertyStore,
        accumulator: &mut BatchAccumulator,
        counters: &mut RunCounters,
        run: RunContext,
    ) -> RunStatistics {
        let source = run.source;

        if !accumulator.is_empty() {
            match accumulator.flush(store).await {
                Ok(outcome) => counters.absorb(&outcome),
                Err(err) => error!(
                    %source,
                    pending = accumulator.len(),
                    error = %err,
                    "final flush failed"
                ),
            }
        }

        let cutoff = Utc::now() - self.stale_after;
        match store.mark_stale_inactive(source, cutoff).await {
            Ok(flagged) => info!(%source, flagged, %cutoff, "stale listings marked inactive"),
            Err(err) => error!(%source, error = %err, "staleness sweep failed"),
        }

        match store.remove_duplicates().await {
            Ok(removed) => info!(removed, "duplicate listings removed"),
            Err(err) => error!(error = %err, "duplicate removal failed"),
        }

        let stats = counters.statistics(run, Utc::now());
        match store.record_run(&stats).await {
            Ok(()) => info!(
                %source,
                reason = %stats.reason,
                total = stats.total_properties,
                new = stats.new_properties,
                updated = stats.updated_properties,
                pages = stats.total_pages,
                duration_seconds = stats.duration_seconds,
                "run statistics recorded"
            ),
            Err(err) => error!(%source, error = %err, "recording run statistics failed"),
        }

        store.close().await;
        stats
    }
}
