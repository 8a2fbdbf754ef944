//! PostgreSQL-backed property store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homepedia_core::{Property, RunStatistics, Source};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Acquire;
use tracing::{info, warn};

use crate::store::{PropertyStore, StoreError, UpsertOutcome, WriteFailure};

const UPSERT_PROPERTY: &str = r#"
INSERT INTO real_estate (
    listing_url, source, department, city, postal_code, address,
    price, price_per_m2, surface_m2, rooms, bedrooms, property_type,
    features, description, first_seen_at, last_seen_at, update_count, is_active
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
ON CONFLICT (listing_url) DO UPDATE SET
    source = EXCLUDED.source,
    department = EXCLUDED.department,
    city = EXCLUDED.city,
    postal_code = EXCLUDED.postal_code,
    address = EXCLUDED.address,
    price = EXCLUDED.price,
    price_per_m2 = EXCLUDED.price_per_m2,
    surface_m2 = EXCLUDED.surface_m2,
    rooms = EXCLUDED.rooms,
    bedrooms = EXCLUDED.bedrooms,
    property_type = EXCLUDED.property_type,
    features = EXCLUDED.features,
    description = EXCLUDED.description,
    last_seen_at = EXCLUDED.last_seen_at,
    update_count = real_estate.update_count + 1,
    is_active = TRUE
RETURNING (xmax = 0) AS inserted
"#;

const MARK_STALE: &str = r#"
UPDATE real_estate
SET is_active = FALSE
WHERE source = $1 AND is_active AND last_seen_at < $2
"#;

const REMOVE_DUPLICATES: &str = r#"
DELETE FROM real_estate a
USING real_estate b
WHERE a.listing_url = b.listing_url AND a.id > b.id
"#;

const INSERT_RUN: &str = r#"
INSERT INTO scraping_stats (
    run_id, source, started_at, finished_at, duration_seconds,
    total_properties, new_properties, updated_properties, failed_writes,
    rejected_records, total_pages, properties_per_page, time_per_property,
    incomplete_departments, reason
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
"#;

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgPropertyStore {
    pool: PgPool,
}

impl PgPropertyStore {
    pub async fn connect(database_url: &str, config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn upsert_one(conn: &mut PgConnection, property: &Property) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(UPSERT_PROPERTY)
        .bind(&property.listing_url)
        .bind(property.source.as_str())
        .bind(&property.department)
        .bind(&property.city)
        .bind(&property.postal_code)
        .bind(&property.address)
        .bind(property.price)
        .bind(property.price_per_m2)
        .bind(property.surface_m2)
        .bind(property.rooms)
        .bind(property.bedrooms)
        .bind(property.property_type.as_str())
        .bind(Json(&property.features))
        .bind(&property.description)
        .bind(property.first_seen_at)
        .bind(property.last_seen_at)
        .bind(property.update_count)
        .bind(property.is_active)
        .fetch_one(conn)
        .await
}

#[async_trait]
impl PropertyStore for PgPropertyStore {
    async fn upsert_batch(&self, batch: &[Property]) -> Result<UpsertOutcome, StoreError> {
        let mut outcome = UpsertOutcome::default();
        let mut tx = self.pool.begin().await?;

        // One savepoint per document keeps a constraint violation from
        // aborting the rest of the batch.
        for property in batch {
            if let Some(failure) = WriteFailure::precheck(property) {
                warn!(
                    listing_url = %failure.listing_url,
                    reason = %failure.reason,
                    "document rejected before write"
                );
                outcome.failures.push(failure);
                continue;
            }

            let mut savepoint = tx.begin().await?;
            match upsert_one(&mut savepoint, property).await {
                Ok(inserted) => {
                    savepoint.commit().await?;
                    if inserted {
                        outcome.inserted += 1;
                    } else {
                        outcome.matched += 1;
                        outcome.updated += 1;
                    }
                }
                Err(sqlx::Error::Database(db_err)) => {
                    savepoint.rollback().await?;
                    warn!(
                        listing_url = %property.listing_url,
                        error = %db_err,
                        "document rejected by store"
                    );
                    outcome.failures.push(WriteFailure {
                        listing_url: property.listing_url.clone(),
                        reason: db_err.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn mark_stale_inactive(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(MARK_STALE)
            .bind(source.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_duplicates(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(REMOVE_DUPLICATES).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn record_run(&self, stats: &RunStatistics) -> Result<(), StoreError> {
        sqlx::query(INSERT_RUN)
            .bind(stats.run_id)
            .bind(stats.source.as_str())
            .bind(stats.started_at)
            .bind(stats.finished_at)
            .bind(stats.duration_seconds)
            .bind(stats.total_properties as i64)
            .bind(stats.new_properties as i64)
            .bind(stats.updated_properties as i64)
            .bind(stats.failed_writes as i64)
            .bind(stats.rejected_records as i64)
            .bind(stats.total_pages as i64)
            .bind(stats.properties_per_page)
            .bind(stats.time_per_property)
            .bind(&stats.incomplete_departments)
            .bind(stats.reason.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("postgres pool closed");
    }
}
