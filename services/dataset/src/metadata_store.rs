use crate::config::DatabaseConfig;
use crate::error::{DatasetError, Result};
use crate::models::{DatasetQuery, DatasetRecord, LabelStatus};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Registry of dataset records.
///
/// `claim_one_pending` is the only concurrency primitive of the service: it
/// must select one `Pending` record and mark it `Processing` in a single
/// indivisible operation, so two claimers never receive the same record.
/// Which pending record is returned is unspecified.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up a record by its unique name
    async fn find_by_name(&self, name: &str) -> Result<Option<DatasetRecord>>;

    /// Insert a new record; a taken name yields `DatasetError::Conflict`
    async fn insert(&self, record: &DatasetRecord) -> Result<Uuid>;

    /// Atomically move one `Pending` record to `Processing` and return it
    async fn claim_one_pending(&self) -> Result<Option<DatasetRecord>>;

    /// Move a record to `status`, rejecting edges outside the state machine
    async fn set_status(&self, id: Uuid, status: LabelStatus) -> Result<()>;

    /// Remove a record by name, returning whether one existed
    async fn delete_by_name(&self, name: &str) -> Result<bool>;

    /// List records matching the query, newest first
    async fn list(&self, query: &DatasetQuery) -> Result<Vec<DatasetRecord>>;

    /// Connectivity probe for readiness checks
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Postgres-backed metadata store
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

const RECORD_COLUMNS: &str = "id, name, blob_key, category, label_status, created_at";

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<DatasetRecord>> {
        let record = sqlx::query_as::<_, DatasetRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM dataset_records WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self, record), fields(name = %record.name))]
    async fn insert(&self, record: &DatasetRecord) -> Result<Uuid> {
        let result = sqlx::query(
            r#"
            INSERT INTO dataset_records (
                id, name, blob_key, category, label_status, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6
            )
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.blob_key)
        .bind(&record.category)
        .bind(record.status)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(id = %record.id, blob_key = %record.blob_key, "Dataset record inserted");
                Ok(record.id)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                DatasetError::Conflict(format!("dataset '{}' already exists", record.name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_one_pending(&self) -> Result<Option<DatasetRecord>> {
        // One statement: the row lock taken by the subquery is held until the
        // UPDATE commits, and SKIP LOCKED keeps concurrent claimers apart.
        let record = sqlx::query_as::<_, DatasetRecord>(&format!(
            r#"
            UPDATE dataset_records
            SET label_status = $1
            WHERE id = (
                SELECT id FROM dataset_records
                WHERE label_status = $2
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(LabelStatus::Processing)
        .bind(LabelStatus::Pending)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn set_status(&self, id: Uuid, status: LabelStatus) -> Result<()> {
        let allowed: Vec<i32> = status.predecessors().iter().map(|s| s.code()).collect();

        let result = sqlx::query(
            r#"
            UPDATE dataset_records
            SET label_status = $2
            WHERE id = $1 AND label_status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(&allowed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatasetError::Store(format!(
                "record {} missing or not in a state that may move to {:?}",
                id, status
            )));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_by_name(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dataset_records WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, query: &DatasetQuery) -> Result<Vec<DatasetRecord>> {
        let keyword = query.keyword.as_deref().filter(|k| !k.is_empty());
        let category = query.category.as_deref().filter(|c| !c.is_empty());

        let records = sqlx::query_as::<_, DatasetRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM dataset_records
            WHERE ($1::text IS NULL OR POSITION(LOWER($1) IN LOWER(name)) > 0)
              AND ($2::text IS NULL OR category = $2)
            ORDER BY created_at DESC
            "#
        ))
        .bind(keyword)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
