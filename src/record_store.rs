use crate::config::DatabaseConfig;
use crate::error::RecordStoreError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Allowed test outcome states. The record store enforces the same set with a
/// check constraint; an unrecognized value in a payload fails parsing before
/// it reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Passed,
    Failed,
    Incomplete,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A draft device test record, built from a folder's payload before it has
/// an identity in the backend. Upserting produces the stored form.
#[derive(Debug, Clone)]
pub struct NewDeviceTestRecord {
    pub folder_name: String,
    pub upload_batch: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub data_type: String,
    /// The full payload object, stored verbatim
    pub data: serde_json::Value,
    pub test_results: Option<serde_json::Value>,
    pub test_date: Option<NaiveDate>,
    pub test_status: Option<TestStatus>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
}

/// Stored device test record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeviceTestRecord {
    pub id: Uuid,
    pub folder_name: String,
    pub upload_batch: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub data_type: String,
    pub data: serde_json::Value,
    pub test_results: Option<serde_json::Value>,
    pub test_date: Option<NaiveDate>,
    pub test_status: Option<String>,
    pub notes: Option<String>,
    /// Public URLs of uploaded images; empty until finalized
    pub images: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Structured-record backend. The orchestrator only sees this seam, so tests
/// substitute a mock for the live pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert-or-update keyed by (folder_name, device_id). Conflicts update
    /// the existing row in place; a duplicate is never created.
    async fn upsert(
        &self,
        record: &NewDeviceTestRecord,
    ) -> Result<DeviceTestRecord, RecordStoreError>;

    /// Second-phase write: attach image URLs to every record for a folder,
    /// transitioning them from draft to finalized. Returns rows updated.
    async fn finalize_images(
        &self,
        folder_name: &str,
        image_urls: &[String],
    ) -> Result<u64, RecordStoreError>;
}

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, RecordStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!("Connected to record store");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), RecordStoreError> {
        info!("Running record store migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Record store migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(folder = %record.folder_name, device_id = ?record.device_id))]
    async fn upsert(
        &self,
        record: &NewDeviceTestRecord,
    ) -> Result<DeviceTestRecord, RecordStoreError> {
        let stored = sqlx::query_as::<_, DeviceTestRecord>(
            r#"
            INSERT INTO device_test_records (
                id, folder_name, upload_batch, device_id, device_name, device_type,
                data_type, data, test_results, test_date, test_status, notes,
                images, metadata, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11, $12,
                $13, $14, NOW(), NOW()
            )
            ON CONFLICT (folder_name, device_id) DO UPDATE SET
                upload_batch = EXCLUDED.upload_batch,
                device_name = EXCLUDED.device_name,
                device_type = EXCLUDED.device_type,
                data_type = EXCLUDED.data_type,
                data = EXCLUDED.data,
                test_results = EXCLUDED.test_results,
                test_date = EXCLUDED.test_date,
                test_status = EXCLUDED.test_status,
                notes = EXCLUDED.notes,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING id, folder_name, upload_batch, device_id, device_name, device_type,
                      data_type, data, test_results, test_date, test_status, notes,
                      images, metadata, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.folder_name)
        .bind(&record.upload_batch)
        .bind(&record.device_id)
        .bind(&record.device_name)
        .bind(&record.device_type)
        .bind(&record.data_type)
        .bind(&record.data)
        .bind(&record.test_results)
        .bind(record.test_date)
        .bind(record.test_status.map(|s| s.as_str()))
        .bind(&record.notes)
        .bind(Vec::<String>::new())
        .bind(&record.metadata)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            record_id = %stored.id,
            folder = %stored.folder_name,
            "device test record upserted"
        );

        Ok(stored)
    }

    #[instrument(skip(self, image_urls), fields(folder = %folder_name, url_count = image_urls.len()))]
    async fn finalize_images(
        &self,
        folder_name: &str,
        image_urls: &[String],
    ) -> Result<u64, RecordStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE device_test_records
            SET images = $2, updated_at = NOW()
            WHERE folder_name = $1
            "#,
        )
        .bind(folder_name)
        .bind(image_urls.to_vec())
        .execute(&self.pool)
        .await?;

        debug!(
            folder = %folder_name,
            rows = result.rows_affected(),
            "records finalized with image URLs"
        );

        Ok(result.rows_affected())
    }
}
