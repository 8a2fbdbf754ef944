use homepedia_core::Property;
use homepedia_storage::{PropertyStore, StoreError, UpsertOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ordered write buffer in front of a [`PropertyStore`].
#[derive(Debug)]
pub struct BatchAccumulator {
    buffer: Vec<Property>,
    threshold: usize,
    shutdown: CancellationToken,
}

impl BatchAccumulator {
    pub fn new(threshold: usize, shutdown: CancellationToken) -> Self {
        let threshold = threshold.max(1);
        Self {
            buffer: Vec::with_capacity(threshold),
            threshold,
            shutdown,
        }
    }

    pub fn add(&mut self, property: Property) {
        self.buffer.push(property);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Threshold reached, or shutdown requested with something buffered.
    pub fn should_flush(&self) -> bool {
        self.buffer.len() >= self.threshold
            || (self.shutdown.is_cancelled() && !self.buffer.is_empty())
    }

    /// Writes the buffer. It is cleared only once the store has answered;
    /// documents the store refused are logged and dropped with the rest.
    pub async fn flush(&mut self, store: &dyn PropertyStore) -> Result<UpsertOutcome, StoreError> {
        if self.buffer.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let outcome = store.upsert_batch(&self.buffer).await?;
        for failure in &outcome.failures {
            warn!(
                listing_url = %failure.listing_url,
                reason = %failure.reason,
                "dropping document rejected by store"
            );
        }
        debug!(
            batch = self.buffer.len(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            failed = outcome.failures.len(),
            "batch flushed"
        );
        self.buffer.clear();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use homepedia_core::{RunStatistics, Source};
    use homepedia_storage::MemoryPropertyStore;

    struct DownStore;

    #[async_trait]
    impl PropertyStore for DownStore {
        async fn upsert_batch(&self, _batch: &[Property]) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Closed)
        }
        async fn mark_stale_inactive(&self, _: Source, _: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(StoreError::Closed)
        }
        async fn remove_duplicates(&self) -> Result<u64, StoreError> {
            Err(StoreError::Closed)
        }
        async fn record_run(&self, _: &RunStatistics) -> Result<(), StoreError> {
            Err(StoreError::Closed)
        }
        async fn close(&self) {}
    }

    fn listing(url: &str) -> Property {
        Property::observed(url, Source::Seloger, Utc::now())
    }

    #[test]
    fn flush_is_due_at_threshold_or_on_shutdown() {
        let token = CancellationToken::new();
        let mut acc = BatchAccumulator::new(2, token.clone());
        assert!(!acc.should_flush());

        acc.add(listing("a"));
        assert!(!acc.should_flush());
        token.cancel();
        assert!(acc.should_flush());

        let mut acc = BatchAccumulator::new(2, CancellationToken::new());
        acc.add(listing("a"));
        acc.add(listing("b"));
        assert!(acc.should_flush());
    }

    #[test]
    fn shutdown_with_empty_buffer_needs_no_flush() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!BatchAccumulator::new(10, token).should_flush());
    }

    #[tokio::test]
    async fn successful_flush_clears_buffer() {
        let store = MemoryPropertyStore::new();
        let mut acc = BatchAccumulator::new(10, CancellationToken::new());
        acc.add(listing("a"));
        acc.add(listing("b"));

        let outcome = acc.flush(&store).await.expect("flush");
        assert_eq!(outcome.inserted, 2);
        assert!(acc.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_keeps_buffer() {
        let mut acc = BatchAccumulator::new(10, CancellationToken::new());
        acc.add(listing("a"));

        assert!(acc.flush(&DownStore).await.is_err());
        assert_eq!(acc.len(), 1);
    }
}
