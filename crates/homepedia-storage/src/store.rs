use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homepedia_core::{Property, RunStatistics, Source};
use thiserror::Error;

/// A document the store refused while the rest of its batch went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub listing_url: String,
    pub reason: String,
}

impl WriteFailure {
    /// Checks a row against the table constraints before it is written.
    /// PostgreSQL accepts `NaN` and `Infinity` in a `>= 0` CHECK, so the
    /// finiteness rule is only enforced here.
    pub fn precheck(property: &Property) -> Option<Self> {
        property.constraint_violation().map(|reason| Self {
            listing_url: property.listing_url.clone(),
            reason,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    /// Rows that matched an existing listing.
    pub matched: u64,
    pub failures: Vec<WriteFailure>,
}

impl UpsertOutcome {
    pub fn succeeded(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Store-level failure. Aborts the run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store is closed")]
    Closed,
}

#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Upserts on `listing_url`. Rejected documents land in `failures`.
    async fn upsert_batch(&self, batch: &[Property]) -> Result<UpsertOutcome, StoreError>;

    /// Flags active rows of `source` last seen before `cutoff` as inactive.
    async fn mark_stale_inactive(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Deletes every duplicate `listing_url` row except the oldest.
    async fn remove_duplicates(&self) -> Result<u64, StoreError>;

    async fn record_run(&self, stats: &RunStatistics) -> Result<(), StoreError>;

    async fn close(&self);
}
