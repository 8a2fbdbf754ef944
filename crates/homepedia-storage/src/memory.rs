//! In-process property store used for dry runs and tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homepedia_core::{Property, RunStatistics, Source};
use tokio::sync::Mutex;

use crate::store::{PropertyStore, StoreError, UpsertOutcome, WriteFailure};

/// Clones share rows and the closed flag. [`MemoryPropertyStore::session`]
/// shares rows only.
#[derive(Debug, Clone, Default)]
pub struct MemoryPropertyStore {
    inner: Arc<Mutex<MemoryState>>,
    closed: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<(i64, Property)>,
    next_id: i64,
    runs: Vec<RunStatistics>,
    closes: u64,
}

impl MemoryState {
    fn push(&mut self, property: Property) {
        self.next_id += 1;
        self.rows.push((self.next_id, property));
    }
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle over the same rows that can be closed independently.
    pub fn session(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Inserts a row without uniqueness or constraint checks, like a legacy import.
    pub async fn seed(&self, property: Property) {
        self.inner.lock().await.push(property);
    }

    /// Rows in insertion order.
    pub async fn snapshot(&self) -> Vec<Property> {
        let state = self.inner.lock().await;
        state.rows.iter().map(|(_, p)| p.clone()).collect()
    }

    pub async fn find(&self, listing_url: &str) -> Option<Property> {
        let state = self.inner.lock().await;
        state
            .rows
            .iter()
            .find(|(_, p)| p.listing_url == listing_url)
            .map(|(_, p)| p.clone())
    }

    pub async fn runs(&self) -> Vec<RunStatistics> {
        self.inner.lock().await.runs.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// How many handles over these rows have been closed.
    pub async fn close_count(&self) -> u64 {
        self.inner.lock().await.closes
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    async fn upsert_batch(&self, batch: &[Property]) -> Result<UpsertOutcome, StoreError> {
        self.ensure_open()?;
        let mut state = self.inner.lock().await;

        let mut outcome = UpsertOutcome::default();
        for property in batch {
            if let Some(failure) = WriteFailure::precheck(property) {
                outcome.failures.push(failure);
                continue;
            }

            let position = state
                .rows
                .iter()
                .position(|(_, row)| row.listing_url == property.listing_url);
            match position {
                Some(index) => {
                    let row = &mut state.rows[index].1;
                    let first_seen_at = row.first_seen_at;
                    let update_count = row.update_count + 1;
                    *row = Property {
                        first_seen_at,
                        update_count,
                        is_active: true,
                        ..property.clone()
                    };
                    outcome.matched += 1;
                    outcome.updated += 1;
                }
                None => {
                    state.push(property.clone());
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn mark_stale_inactive(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut state = self.inner.lock().await;
        let mut flagged = 0;
        for (_, row) in state.rows.iter_mut() {
            if row.source == source && row.is_active && row.last_seen_at < cutoff {
                row.is_active = false;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn remove_duplicates(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut state = self.inner.lock().await;
        state.rows.sort_by_key(|(id, _)| *id);
        let before = state.rows.len();
        let mut seen = HashSet::new();
        state
            .rows
            .retain(|(_, row)| seen.insert(row.listing_url.clone()));
        Ok((before - state.rows.len()) as u64)
    }

    async fn record_run(&self, stats: &RunStatistics) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.inner.lock().await;
        state.runs.push(stats.clone());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.inner.lock().await.closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn listing(url: &str, price: f64, seen_at: DateTime<Utc>) -> Property {
        let mut property = Property::observed(url, Source::Bienici, seen_at);
        property.price = price;
        property.surface_m2 = 50.0;
        property
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_first_seen_and_counts_observations() {
        let store = MemoryPropertyStore::new();
        let first = Utc::now() - Duration::days(3);
        let later = Utc::now();

        let outcome = store
            .upsert_batch(&[listing("ad-1", 100_000.0, first)])
            .await
            .expect("first upsert");
        assert_eq!(outcome.inserted, 1);

        let outcome = store
            .upsert_batch(&[listing("ad-1", 95_000.0, later)])
            .await
            .expect("second upsert");
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 1);

        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_seen_at, first);
        assert_eq!(rows[0].last_seen_at, later);
        assert_eq!(rows[0].update_count, 2);
        assert_eq!(rows[0].price, 95_000.0);
    }

    #[tokio::test]
    async fn violating_document_does_not_sink_its_batch() {
        let store = MemoryPropertyStore::new();
        let now = Utc::now();
        let batch = vec![
            listing("ad-1", 100_000.0, now),
            listing("ad-2", -5.0, now),
            listing("ad-3", 120_000.0, now),
        ];

        let outcome = store.upsert_batch(&batch).await.expect("upsert");
        assert_eq!(outcome.succeeded(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].listing_url, "ad-2");
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn staleness_sweep_uses_thirty_day_cutoff_per_source() {
        let store = MemoryPropertyStore::new();
        let now = Utc::now();
        store.seed(listing("old", 1.0, now - Duration::days(31))).await;
        store.seed(listing("recent", 1.0, now - Duration::days(29))).await;
        let mut other_source = listing("dvf_old", 1.0, now - Duration::days(31));
        other_source.source = Source::Dvf;
        store.seed(other_source).await;

        let flagged = store
            .mark_stale_inactive(Source::Bienici, now - Duration::days(30))
            .await
            .expect("sweep");
        assert_eq!(flagged, 1);
        assert!(!store.find("old").await.expect("old").is_active);
        assert!(store.find("recent").await.expect("recent").is_active);
        assert!(store.find("dvf_old").await.expect("dvf_old").is_active);
    }

    #[tokio::test]
    async fn reobserving_an_inactive_listing_reactivates_it() {
        let store = MemoryPropertyStore::new();
        let mut stale = listing("ad-1", 1.0, Utc::now() - Duration::days(40));
        stale.is_active = false;
        store.seed(stale).await;

        store
            .upsert_batch(&[listing("ad-1", 1.0, Utc::now())])
            .await
            .expect("upsert");
        assert!(store.find("ad-1").await.expect("row").is_active);
    }

    #[tokio::test]
    async fn duplicate_removal_keeps_the_oldest_row() {
        let store = MemoryPropertyStore::new();
        let now = Utc::now();
        store.seed(listing("ad-1", 1.0, now)).await;
        store.seed(listing("ad-1", 2.0, now)).await;
        store.seed(listing("ad-2", 3.0, now)).await;

        let removed = store.remove_duplicates().await.expect("dedup");
        assert_eq!(removed, 1);
        assert_eq!(store.find("ad-1").await.expect("row").price, 1.0);
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn closed_store_refuses_writes() {
        let store = MemoryPropertyStore::new();
        store.close().await;
        assert!(store.is_closed());
        assert!(matches!(
            store.upsert_batch(&[listing("ad-1", 1.0, Utc::now())]).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn sessions_share_rows_but_close_independently() {
        let store = MemoryPropertyStore::new();
        let first = store.session();
        first
            .upsert_batch(&[listing("ad-1", 1.0, Utc::now())])
            .await
            .expect("upsert");
        first.close().await;

        let second = store.session();
        assert!(!second.is_closed());
        assert!(second.find("ad-1").await.is_some());
        second
            .upsert_batch(&[listing("ad-2", 2.0, Utc::now())])
            .await
            .expect("upsert");
        assert_eq!(store.snapshot().await.len(), 2);
        assert_eq!(store.close_count().await, 1);
    }
}
