use crate::blob_store::BlobStore;
use crate::error::FolderError;
use crate::outcome::{
    data_preview, FailedImage, ImageUploadOutcome, JsonUploadOutcome, UploadOutcome, UploadedImage,
    FAILED_MARKER, SUCCESS_MARKER,
};
use crate::record_store::{NewDeviceTestRecord, RecordStore, TestStatus};
use crate::scanner::WorkUnit;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Parsed fields of a device test payload. Unknown keys are ignored; the full
/// document is stored verbatim in the record's `data` column.
#[derive(Debug, Deserialize)]
struct DeviceTestPayload {
    #[serde(default = "default_data_type")]
    data_type: String,
    device_id: Option<String>,
    device_name: Option<String>,
    device_type: Option<String>,
    test_results: Option<Value>,
    test_date: Option<NaiveDate>,
    #[serde(default = "default_test_status")]
    test_status: Option<TestStatus>,
    upload_batch: Option<String>,
    notes: Option<String>,
    #[serde(default = "default_metadata")]
    metadata: Value,
}

fn default_data_type() -> String {
    "device_test".to_string()
}

fn default_test_status() -> Option<TestStatus> {
    Some(TestStatus::Pending)
}

fn default_metadata() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Processes one work unit end to end: metadata upsert, image uploads, the
/// finalizing image-URL write, and the marker file. All failures are captured
/// into the returned outcome; nothing propagates past this boundary, so one
/// folder's failure never stops the rest of the run.
pub struct UploadOrchestrator<R, B> {
    record_store: Arc<R>,
    blob_store: Arc<B>,
    image_extensions: Vec<String>,
}

impl<R: RecordStore, B: BlobStore> UploadOrchestrator<R, B> {
    pub fn new(record_store: Arc<R>, blob_store: Arc<B>, image_extensions: Vec<String>) -> Self {
        let image_extensions = image_extensions
            .into_iter()
            .map(|e| e.to_ascii_lowercase())
            .collect();
        Self {
            record_store,
            blob_store,
            image_extensions,
        }
    }

    #[instrument(skip(self, unit), fields(folder = %unit.name))]
    pub async fn process(&self, unit: &WorkUnit) -> UploadOutcome {
        info!(folder = %unit.name, "processing folder");

        let mut outcome = UploadOutcome::new(unit);

        outcome.json_upload = self.upload_metadata(unit).await;
        if let Some(err) = &outcome.json_upload.error {
            warn!(folder = %unit.name, error = %err.message, "metadata phase failed");
        }

        // Images are only attempted once the draft record exists; without it
        // there is nothing to finalize against, and a re-run retries the
        // whole folder anyway.
        if outcome.json_upload.success {
            outcome.image_upload = self.upload_images(unit).await;

            if outcome.image_upload.successful_uploads > 0 {
                let urls: Vec<String> = outcome
                    .image_upload
                    .uploaded_images
                    .iter()
                    .map(|img| img.public_url.clone())
                    .collect();

                match self.record_store.finalize_images(&unit.name, &urls).await {
                    Ok(rows) => info!(
                        folder = %unit.name,
                        rows,
                        urls = urls.len(),
                        "records finalized with image URLs"
                    ),
                    Err(e) => warn!(
                        folder = %unit.name,
                        error = %e,
                        "failed to finalize records with image URLs"
                    ),
                }
            }
        }

        outcome.finish();

        match outcome.write_marker() {
            Ok(path) => info!(folder = %unit.name, marker = %path.display(), "marker written"),
            Err(e) => warn!(folder = %unit.name, error = %e, "failed to write marker file"),
        }

        outcome
    }

    async fn upload_metadata(&self, unit: &WorkUnit) -> JsonUploadOutcome {
        let filename = match locate_metadata_file(&unit.path, &unit.name) {
            Ok(f) => f,
            Err(e) => return JsonUploadOutcome::failure(None, None, &e),
        };

        let raw = match tokio::fs::read_to_string(unit.path.join(&filename)).await {
            Ok(r) => r,
            Err(source) => {
                let err = FolderError::Read {
                    filename: filename.clone(),
                    source,
                };
                return JsonUploadOutcome::failure(Some(filename), None, &err);
            }
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(source) => {
                let err = FolderError::Parse {
                    filename: filename.clone(),
                    source,
                };
                return JsonUploadOutcome::failure(Some(filename), None, &err);
            }
        };

        let preview = data_preview(&value);

        let records = match build_records(&unit.name, &filename, &value) {
            Ok(r) => r,
            Err(e) => return JsonUploadOutcome::failure(Some(filename), Some(preview), &e),
        };

        let count = records.len() as u64;
        for record in &records {
            if let Err(e) = self.record_store.upsert(record).await {
                let err = FolderError::from(e);
                return JsonUploadOutcome::failure(Some(filename), Some(preview), &err);
            }
        }

        info!(
            folder = %unit.name,
            file = %filename,
            records = count,
            "device test records upserted"
        );

        JsonUploadOutcome {
            success: true,
            filename: Some(filename),
            records_upserted: Some(count),
            error: None,
            data_preview: Some(preview),
        }
    }

    async fn upload_images(&self, unit: &WorkUnit) -> ImageUploadOutcome {
        let files = match self.list_image_files(&unit.path) {
            Ok(f) => f,
            Err(e) => {
                warn!(folder = %unit.name, error = %e, "failed to enumerate images");
                return ImageUploadOutcome::default();
            }
        };

        let mut result = ImageUploadOutcome {
            total_images: files.len(),
            ..Default::default()
        };

        for filename in files {
            let path = unit.path.join(&filename);
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(folder = %unit.name, image = %filename, error = %e, "failed to read image");
                    result.failures.push(FailedImage {
                        error: e.to_string(),
                        retryable: true,
                        filename,
                    });
                    continue;
                }
            };
            let size_bytes = bytes.len() as u64;

            match self.blob_store.upload(&unit.name, &filename, bytes).await {
                Ok(public_url) => {
                    info!(folder = %unit.name, image = %filename, url = %public_url, "image uploaded");
                    result.uploaded_images.push(UploadedImage {
                        storage_path: format!("{}/{}", unit.name, filename),
                        public_url,
                        size_bytes,
                        filename,
                    });
                }
                Err(e) => {
                    warn!(folder = %unit.name, image = %filename, error = %e, "image upload failed");
                    result.failures.push(FailedImage {
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                        filename,
                    });
                }
            }
        }

        result.successful_uploads = result.uploaded_images.len();
        result.failed_uploads = result.failures.len();
        result
    }

    fn list_image_files(&self, folder: &Path) -> std::io::Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in fs::read_dir(folder)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let matches = Path::new(&name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .map(|e| self.image_extensions.iter().any(|allowed| *allowed == e))
                .unwrap_or(false);
            if matches {
                files.push(name);
            }
        }

        // Deterministic upload order
        files.sort();
        Ok(files)
    }
}

/// Exactly one JSON metadata file is expected per folder; markers left by
/// previous runs do not count.
fn locate_metadata_file(folder: &Path, folder_name: &str) -> Result<String, FolderError> {
    let entries = fs::read_dir(folder).map_err(|source| FolderError::Read {
        filename: folder_name.to_string(),
        source,
    })?;

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| FolderError::Read {
            filename: folder_name.to_string(),
            source,
        })?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == SUCCESS_MARKER || name == FAILED_MARKER {
            continue;
        }
        let is_json = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            candidates.push(name);
        }
    }

    match candidates.len() {
        0 => Err(FolderError::MissingData),
        1 => Ok(candidates.remove(0)),
        _ => {
            candidates.sort();
            Err(FolderError::AmbiguousData { candidates })
        }
    }
}

/// One draft record per payload object: a bare object yields one, an array
/// yields one per object entry (non-object entries are skipped).
fn build_records(
    folder_name: &str,
    filename: &str,
    value: &Value,
) -> Result<Vec<NewDeviceTestRecord>, FolderError> {
    match value {
        Value::Object(_) => Ok(vec![record_from_object(folder_name, filename, value)?]),
        Value::Array(items) => {
            let objects: Vec<&Value> = items.iter().filter(|v| v.is_object()).collect();
            if objects.len() < items.len() {
                warn!(
                    file = %filename,
                    skipped = items.len() - objects.len(),
                    "skipping non-object entries in payload array"
                );
            }
            if objects.is_empty() {
                return Err(FolderError::InvalidPayload {
                    filename: filename.to_string(),
                    reason: "array contains no objects".to_string(),
                });
            }
            objects
                .into_iter()
                .map(|v| record_from_object(folder_name, filename, v))
                .collect()
        }
        _ => Err(FolderError::InvalidPayload {
            filename: filename.to_string(),
            reason: "expected an object or an array of objects".to_string(),
        }),
    }
}

fn record_from_object(
    folder_name: &str,
    filename: &str,
    value: &Value,
) -> Result<NewDeviceTestRecord, FolderError> {
    let payload: DeviceTestPayload =
        serde_json::from_value(value.clone()).map_err(|source| FolderError::Parse {
            filename: filename.to_string(),
            source,
        })?;

    Ok(NewDeviceTestRecord {
        folder_name: folder_name.to_string(),
        upload_batch: payload.upload_batch,
        device_id: payload.device_id,
        device_name: payload.device_name,
        device_type: payload.device_type,
        data_type: payload.data_type,
        data: value.clone(),
        test_results: payload.test_results,
        test_date: payload.test_date,
        test_status: payload.test_status,
        notes: payload.notes,
        metadata: payload.metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MockBlobStore;
    use crate::config::default_image_extensions;
    use crate::error::{BlobStoreError, RecordStoreError};
    use crate::record_store::{DeviceTestRecord, MockRecordStore};
    use chrono::Utc;
    use serde_json::json;
    use std::time::SystemTime;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn folder(tmp: &TempDir, name: &str) -> WorkUnit {
        let path = tmp.path().join(name);
        fs::create_dir(&path).unwrap();
        WorkUnit {
            name: name.to_string(),
            path,
            modified: SystemTime::now(),
        }
    }

    fn write_file(unit: &WorkUnit, name: &str, contents: &[u8]) {
        fs::write(unit.path.join(name), contents).unwrap();
    }

    fn stored(record: &NewDeviceTestRecord) -> DeviceTestRecord {
        DeviceTestRecord {
            id: Uuid::new_v4(),
            folder_name: record.folder_name.clone(),
            upload_batch: record.upload_batch.clone(),
            device_id: record.device_id.clone(),
            device_name: record.device_name.clone(),
            device_type: record.device_type.clone(),
            data_type: record.data_type.clone(),
            data: record.data.clone(),
            test_results: record.test_results.clone(),
            test_date: record.test_date,
            test_status: record.test_status.map(|s| s.as_str().to_string()),
            notes: record.notes.clone(),
            images: Vec::new(),
            metadata: record.metadata.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn orchestrator(
        record_store: MockRecordStore,
        blob_store: MockBlobStore,
    ) -> UploadOrchestrator<MockRecordStore, MockBlobStore> {
        UploadOrchestrator::new(
            Arc::new(record_store),
            Arc::new(blob_store),
            default_image_extensions(),
        )
    }

    #[tokio::test]
    async fn folder_with_metadata_and_images_succeeds() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_001");
        write_file(
            &unit,
            "data.json",
            br#"{"device_id": "DEV-1", "test_status": "passed"}"#,
        );
        write_file(&unit, "front.jpg", b"jpeg bytes");
        write_file(&unit, "back.png", b"png bytes");

        let mut record_store = MockRecordStore::new();
        record_store
            .expect_upsert()
            .times(1)
            .withf(|record| {
                record.folder_name == "dev_001"
                    && record.device_id.as_deref() == Some("DEV-1")
                    && record.test_status == Some(TestStatus::Passed)
            })
            .returning(|record| Ok(stored(record)));
        record_store
            .expect_finalize_images()
            .times(1)
            .withf(|folder, urls| folder == "dev_001" && urls.len() == 2)
            .returning(|_, _| Ok(1));

        let mut blob_store = MockBlobStore::new();
        blob_store
            .expect_upload()
            .times(2)
            .returning(|ns, file, _| Ok(format!("https://blobs.test/{ns}/{file}")));

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(outcome.summary.overall_success);
        assert_eq!(outcome.json_upload.records_upserted, Some(1));
        assert_eq!(outcome.image_upload.total_images, 2);
        assert_eq!(outcome.image_upload.successful_uploads, 2);
        assert!(outcome.image_upload.failures.is_empty());
        assert!(unit.path.join(SUCCESS_MARKER).is_file());

        let marker: UploadOutcome = serde_json::from_str(
            &fs::read_to_string(unit.path.join(SUCCESS_MARKER)).unwrap(),
        )
        .unwrap();
        assert!(marker.json_upload.success);
        assert_eq!(marker.image_upload.uploaded_images.len(), 2);
    }

    #[tokio::test]
    async fn ambiguous_metadata_fails_without_any_writes() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_002");
        write_file(&unit, "a.json", b"{}");
        write_file(&unit, "b.json", b"{}");
        write_file(&unit, "photo.jpg", b"jpeg bytes");

        let mut record_store = MockRecordStore::new();
        record_store.expect_upsert().never();
        record_store.expect_finalize_images().never();
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().never();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(!outcome.summary.overall_success);
        assert!(!outcome.json_upload.success);
        let error = outcome.json_upload.error.unwrap();
        assert!(error.message.contains("multiple JSON metadata files"));
        assert!(!error.retryable);
        assert_eq!(outcome.image_upload.total_images, 0);
        assert!(unit.path.join(FAILED_MARKER).is_file());
    }

    #[tokio::test]
    async fn missing_metadata_fails_without_any_writes() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_004");
        write_file(&unit, "photo.jpg", b"jpeg bytes");

        let mut record_store = MockRecordStore::new();
        record_store.expect_upsert().never();
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().never();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(!outcome.summary.overall_success);
        assert_eq!(
            outcome.json_upload.error.unwrap().message,
            "no JSON metadata file found in folder"
        );
        assert!(unit.path.join(FAILED_MARKER).is_file());
    }

    #[tokio::test]
    async fn malformed_metadata_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_005");
        write_file(&unit, "data.json", b"{not json");

        let mut record_store = MockRecordStore::new();
        record_store.expect_upsert().never();
        let blob_store = MockBlobStore::new();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(!outcome.json_upload.success);
        assert_eq!(outcome.json_upload.filename.as_deref(), Some("data.json"));
        assert!(outcome
            .json_upload
            .error
            .unwrap()
            .message
            .contains("failed to parse data.json"));
    }

    #[tokio::test]
    async fn image_failure_keeps_record_but_fails_folder() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_003");
        write_file(&unit, "data.json", br#"{"device_id": "DEV-3"}"#);
        write_file(&unit, "photo.jpg", b"jpeg bytes");

        let mut record_store = MockRecordStore::new();
        record_store
            .expect_upsert()
            .times(1)
            .returning(|record| Ok(stored(record)));
        record_store.expect_finalize_images().never();

        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().times(1).returning(|ns, file, _| {
            Err(BlobStoreError::Transport {
                key: format!("{ns}/{file}"),
                message: "connection reset".to_string(),
            })
        });

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(outcome.json_upload.success);
        assert_eq!(outcome.image_upload.total_images, 1);
        assert_eq!(outcome.image_upload.successful_uploads, 0);
        assert_eq!(outcome.image_upload.failed_uploads, 1);
        assert!(outcome.image_upload.failures[0].retryable);
        assert!(!outcome.summary.overall_success);
        assert!(unit.path.join(FAILED_MARKER).is_file());
    }

    #[tokio::test]
    async fn partial_image_failure_finalizes_successful_urls_only() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_015");
        write_file(&unit, "data.json", br#"{"device_id": "DEV-15"}"#);
        write_file(&unit, "bad.jpg", b"jpeg bytes");
        write_file(&unit, "good.png", b"png bytes");

        let mut record_store = MockRecordStore::new();
        record_store
            .expect_upsert()
            .times(1)
            .returning(|record| Ok(stored(record)));
        record_store
            .expect_finalize_images()
            .times(1)
            .withf(|_, urls| urls == ["https://blobs.test/dev_015/good.png"])
            .returning(|_, _| Ok(1));

        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().times(2).returning(|ns, file, _| {
            if file == "bad.jpg" {
                Err(BlobStoreError::Transport {
                    key: format!("{ns}/{file}"),
                    message: "connection reset".to_string(),
                })
            } else {
                Ok(format!("https://blobs.test/{ns}/{file}"))
            }
        });

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(!outcome.summary.overall_success);
        assert_eq!(outcome.image_upload.total_images, 2);
        assert_eq!(outcome.image_upload.successful_uploads, 1);
        assert_eq!(outcome.image_upload.uploaded_images.len(), 1);
        assert_eq!(outcome.image_upload.failed_uploads, 1);
        assert!(unit.path.join(FAILED_MARKER).is_file());
    }

    #[tokio::test]
    async fn zero_images_succeeds_on_metadata_alone() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_006");
        write_file(&unit, "data.json", br#"{"device_id": "DEV-6"}"#);

        let mut record_store = MockRecordStore::new();
        record_store
            .expect_upsert()
            .times(1)
            .returning(|record| Ok(stored(record)));
        record_store.expect_finalize_images().never();
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().never();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(outcome.summary.overall_success);
        assert!(unit.path.join(SUCCESS_MARKER).is_file());
    }

    #[tokio::test]
    async fn array_payload_upserts_one_record_per_object() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_007");
        write_file(
            &unit,
            "batch.json",
            br#"[{"device_id": "DEV-7A"}, {"device_id": "DEV-7B"}]"#,
        );

        let mut record_store = MockRecordStore::new();
        record_store
            .expect_upsert()
            .times(2)
            .returning(|record| Ok(stored(record)));
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().never();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(outcome.summary.overall_success);
        assert_eq!(outcome.json_upload.records_upserted, Some(2));
    }

    #[tokio::test]
    async fn unknown_test_status_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_008");
        write_file(&unit, "data.json", br#"{"test_status": "exploded"}"#);

        let mut record_store = MockRecordStore::new();
        record_store.expect_upsert().never();
        let blob_store = MockBlobStore::new();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(!outcome.json_upload.success);
        assert!(!outcome.summary.overall_success);
    }

    #[tokio::test]
    async fn record_store_rejection_skips_images() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_009");
        write_file(&unit, "data.json", br#"{"device_id": "DEV-9"}"#);
        write_file(&unit, "photo.jpg", b"jpeg bytes");

        let mut record_store = MockRecordStore::new();
        record_store
            .expect_upsert()
            .times(1)
            .returning(|_| Err(RecordStoreError::Rejected(sqlx::Error::RowNotFound)));
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().never();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(!outcome.json_upload.success);
        let error = outcome.json_upload.error.unwrap();
        assert!(!error.retryable);
        assert_eq!(outcome.image_upload.total_images, 0);
        assert!(unit.path.join(FAILED_MARKER).is_file());
    }

    #[tokio::test]
    async fn stale_failure_marker_does_not_count_as_metadata() {
        let tmp = TempDir::new().unwrap();
        let unit = folder(&tmp, "dev_010");
        write_file(&unit, "data.json", br#"{"device_id": "DEV-10"}"#);
        write_file(&unit, FAILED_MARKER, b"{}");

        let mut record_store = MockRecordStore::new();
        record_store
            .expect_upsert()
            .times(1)
            .returning(|record| Ok(stored(record)));
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().never();

        let outcome = orchestrator(record_store, blob_store).process(&unit).await;

        assert!(outcome.summary.overall_success);
        assert!(unit.path.join(SUCCESS_MARKER).is_file());
    }

    #[test]
    fn payload_defaults_mirror_the_schema() {
        let records = build_records("dev_011", "data.json", &json!({})).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.data_type, "device_test");
        assert_eq!(record.test_status, Some(TestStatus::Pending));
        assert!(record.device_id.is_none());
        assert_eq!(record.metadata, json!({}));
    }

    #[test]
    fn explicit_null_test_status_stays_null() {
        let records =
            build_records("dev_012", "data.json", &json!({"test_status": null})).unwrap();
        assert_eq!(records[0].test_status, None);
    }

    #[test]
    fn empty_array_payload_is_invalid() {
        let err = build_records("dev_013", "data.json", &json!([])).unwrap_err();
        assert!(matches!(err, FolderError::InvalidPayload { .. }));
    }

    #[test]
    fn scalar_payload_is_invalid() {
        let err = build_records("dev_014", "data.json", &json!(42)).unwrap_err();
        assert!(matches!(err, FolderError::InvalidPayload { .. }));
    }
}
