//! Staging backends: upsert the final cluster set keyed by `(source, source_native_id)`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use catalog_core::{shard_key, Cluster, NormalizedRecord, RecordKey, ReleaseDate};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagingReceipt {
    pub backend: String,
    pub records: usize,
    pub clusters: usize,
}

#[async_trait]
pub trait StagingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Upsert every member record and cluster of one run. Either all rows land or none.
    async fn stage(&self, run_id: Uuid, clusters: &[Cluster]) -> Result<StagingReceipt>;
}

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPool::connect(database_url)
        .await
        .with_context(|| "connecting to staging database".to_string())
}

pub async fn run_migrations(database_url: &str) -> Result<()> {
    let pool = connect(database_url).await?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying catalog migrations")?;
    info!("catalog migrations applied");
    Ok(())
}

pub struct PgStagingBackend {
    pool: PgPool,
}

impl PgStagingBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(connect(database_url).await?))
    }
}

fn release_columns(date: &ReleaseDate) -> (Option<chrono::NaiveDate>, Option<i32>, Option<i32>) {
    match date {
        ReleaseDate::Day { date } => {
            use chrono::Datelike;
            (Some(*date), Some(date.year()), Some(date.month() as i32))
        }
        ReleaseDate::Month { year, month } => (None, Some(*year), Some(*month as i32)),
        ReleaseDate::Year { year } => (None, Some(*year), None),
        ReleaseDate::Unknown => (None, None, None),
    }
}

fn precision_label(date: &ReleaseDate) -> String {
    serde_json::to_value(date.precision())
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn upsert_record(
    tx: &mut sqlx::PgConnection,
    run_id: Uuid,
    record: &NormalizedRecord,
) -> Result<()> {
    let (release_date, release_year, release_month) = release_columns(&record.release_date);
    let platforms = serde_json::to_value(&record.platforms)?;
    sqlx::query(
        r#"
        INSERT INTO catalog_records (
            source, source_native_id, source_url, title, title_key, edition,
            price_minor, currency, release_precision, release_date, release_year,
            release_month, platforms, publisher, developer, image_url, rating,
            last_run_id, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, NOW())
        ON CONFLICT (source, source_native_id) DO UPDATE SET
            source_url = EXCLUDED.source_url,
            title = EXCLUDED.title,
            title_key = EXCLUDED.title_key,
            edition = EXCLUDED.edition,
            price_minor = EXCLUDED.price_minor,
            currency = EXCLUDED.currency,
            release_precision = EXCLUDED.release_precision,
            release_date = EXCLUDED.release_date,
            release_year = EXCLUDED.release_year,
            release_month = EXCLUDED.release_month,
            platforms = EXCLUDED.platforms,
            publisher = EXCLUDED.publisher,
            developer = EXCLUDED.developer,
            image_url = EXCLUDED.image_url,
            rating = EXCLUDED.rating,
            last_run_id = EXCLUDED.last_run_id,
            updated_at = NOW()
        "#,
    )
    .bind(&record.source)
    .bind(&record.source_native_id)
    .bind(&record.source_url)
    .bind(&record.title)
    .bind(&record.title_key)
    .bind(&record.edition)
    .bind(record.price.as_ref().map(|p| p.amount_minor as i64))
    .bind(record.price.as_ref().map(|p| p.currency.clone()))
    .bind(precision_label(&record.release_date))
    .bind(release_date)
    .bind(release_year)
    .bind(release_month)
    .bind(platforms)
    .bind(&record.publisher)
    .bind(&record.developer)
    .bind(&record.image_url)
    .bind(&record.rating)
    .bind(run_id)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("upserting record {}", record.key()))?;
    Ok(())
}

async fn upsert_cluster(tx: &mut sqlx::PgConnection, run_id: Uuid, cluster: &Cluster) -> Result<()> {
    let canonical = &cluster.canonical;
    sqlx::query(
        r#"
        INSERT INTO catalog_clusters (
            cluster_id, confidence, canonical_source, canonical_native_id,
            title, title_key, shard, member_count, last_run_id, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
        ON CONFLICT (cluster_id) DO UPDATE SET
            confidence = EXCLUDED.confidence,
            canonical_source = EXCLUDED.canonical_source,
            canonical_native_id = EXCLUDED.canonical_native_id,
            title = EXCLUDED.title,
            title_key = EXCLUDED.title_key,
            shard = EXCLUDED.shard,
            member_count = EXCLUDED.member_count,
            last_run_id = EXCLUDED.last_run_id,
            updated_at = NOW()
        "#,
    )
    .bind(cluster.cluster_id)
    .bind(cluster.confidence)
    .bind(&canonical.source)
    .bind(&canonical.source_native_id)
    .bind(&canonical.title)
    .bind(&canonical.title_key)
    .bind(shard_key(&canonical.title_key).to_string())
    .bind(cluster.members.len() as i32)
    .bind(run_id)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("upserting cluster {}", cluster.cluster_id))?;

    for member in &cluster.members {
        sqlx::query(
            r#"
            INSERT INTO catalog_cluster_members (cluster_id, source, source_native_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (source, source_native_id) DO UPDATE SET cluster_id = EXCLUDED.cluster_id
            "#,
        )
        .bind(cluster.cluster_id)
        .bind(&member.source)
        .bind(&member.source_native_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("linking {} to cluster {}", member.key(), cluster.cluster_id))?;
    }
    Ok(())
}

#[async_trait]
impl StagingBackend for PgStagingBackend {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn stage(&self, run_id: Uuid, clusters: &[Cluster]) -> Result<StagingReceipt> {
        let mut tx = self.pool.begin().await.context("opening staging transaction")?;
        let mut records = 0usize;

        for cluster in clusters {
            for member in &cluster.members {
                upsert_record(&mut *tx, run_id, member).await?;
                records += 1;
            }
        }
        for cluster in clusters {
            upsert_cluster(&mut *tx, run_id, cluster).await?;
        }

        // Clusters whose members all moved elsewhere.
        sqlx::query(
            r#"
            DELETE FROM catalog_clusters c
             WHERE NOT EXISTS (
                   SELECT 1 FROM catalog_cluster_members m WHERE m.cluster_id = c.cluster_id
             )
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("pruning empty clusters")?;

        sqlx::query(
            r#"
            INSERT INTO catalog_runs (run_id, record_count, cluster_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (run_id) DO UPDATE SET
                record_count = EXCLUDED.record_count,
                cluster_count = EXCLUDED.cluster_count,
                staged_at = NOW()
            "#,
        )
        .bind(run_id)
        .bind(records as i32)
        .bind(clusters.len() as i32)
        .execute(&mut *tx)
        .await
        .context("recording staging run")?;

        tx.commit().await.context("committing staging transaction")?;
        info!(%run_id, records, clusters = clusters.len(), "staged catalog");
        Ok(StagingReceipt {
            backend: self.name().to_string(),
            records,
            clusters: clusters.len(),
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RecordKey, NormalizedRecord>,
    memberships: BTreeMap<RecordKey, Uuid>,
    clusters: BTreeMap<Uuid, Cluster>,
    runs: Vec<Uuid>,
}

/// Same upsert semantics as the Postgres backend, held in memory.
#[derive(Debug, Default)]
pub struct MemoryStagingBackend {
    state: Mutex<MemoryState>,
    failure: Option<String>,
}

impl MemoryStagingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose every `stage` call fails, for exercising run-fatal paths.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            state: Mutex::default(),
            failure: Some(message.into()),
        }
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn cluster_ids(&self) -> Vec<Uuid> {
        self.state.lock().await.clusters.keys().copied().collect()
    }

    pub async fn cluster_of(&self, key: &RecordKey) -> Option<Uuid> {
        self.state.lock().await.memberships.get(key).copied()
    }

    pub async fn runs(&self) -> Vec<Uuid> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl StagingBackend for MemoryStagingBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn stage(&self, run_id: Uuid, clusters: &[Cluster]) -> Result<StagingReceipt> {
        if let Some(message) = &self.failure {
            anyhow::bail!("staging backend unavailable: {message}");
        }
        let mut state = self.state.lock().await;
        let mut records = 0usize;
        for cluster in clusters {
            for member in &cluster.members {
                state.records.insert(member.key(), member.clone());
                state.memberships.insert(member.key(), cluster.cluster_id);
                records += 1;
            }
            state.clusters.insert(cluster.cluster_id, cluster.clone());
        }
        let live = state.memberships.values().copied().collect::<std::collections::BTreeSet<_>>();
        state.clusters.retain(|id, _| live.contains(id));
        if !state.runs.contains(&run_id) {
            state.runs.push(run_id);
        }
        Ok(StagingReceipt {
            backend: self.name().to_string(),
            records,
            clusters: clusters.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::singleton_clusters;
    use catalog_core::Price;

    fn record(source: &str, id: &str, title: &str) -> NormalizedRecord {
        NormalizedRecord {
            source: source.to_string(),
            source_native_id: id.to_string(),
            source_url: None,
            title: title.to_string(),
            title_key: title.to_lowercase(),
            edition: None,
            price: Some(Price::new(999, "USD")),
            release_date: ReleaseDate::year(2021),
            platforms: Vec::new(),
            publisher: None,
            developer: None,
            image_url: None,
            rating: None,
        }
    }

    #[tokio::test]
    async fn memory_backend_upserts_by_record_key() {
        let backend = MemoryStagingBackend::new();
        let first = singleton_clusters(&[record("steam", "1", "Inside"), record("psn", "2", "Inside")]);
        let receipt = backend.stage(Uuid::nil(), &first).await.unwrap();
        assert_eq!(receipt.records, 2);
        assert_eq!(backend.cluster_ids().await.len(), 2);

        // The same records merged into one cluster replace the old memberships.
        let mut merged = first[0].clone();
        merged.members = first.iter().flat_map(|c| c.members.clone()).collect();
        merged.cluster_id = catalog_core::cluster_id_for(&merged.member_keys());
        backend.stage(Uuid::from_u128(1), &[merged.clone()]).await.unwrap();

        assert_eq!(backend.record_count().await, 2);
        assert_eq!(backend.cluster_ids().await, vec![merged.cluster_id]);
        assert_eq!(
            backend.cluster_of(&RecordKey::new("psn", "2")).await,
            Some(merged.cluster_id)
        );
        assert_eq!(backend.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn failing_backend_reports_an_error() {
        let backend = MemoryStagingBackend::failing("connection refused");
        let err = backend.stage(Uuid::nil(), &[]).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn release_columns_follow_precision() {
        assert_eq!(release_columns(&ReleaseDate::year(2020)), (None, Some(2020), None));
        assert_eq!(
            release_columns(&ReleaseDate::month(2020, 4).unwrap()),
            (None, Some(2020), Some(4))
        );
        assert_eq!(precision_label(&ReleaseDate::Unknown), "unknown");
        assert_eq!(precision_label(&ReleaseDate::year(1999)), "year");
    }
}
