use crate::error::FolderError;
use crate::scanner::WorkUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Marker written into a folder after every file uploaded successfully.
/// Its presence excludes the folder from future scans.
pub const SUCCESS_MARKER: &str = "upload_success.json";

/// Marker written into a folder when any part of processing failed. Does not
/// suppress rescanning; it exists for the operator, not the scanner.
pub const FAILED_MARKER: &str = "upload_failed.json";

/// Ephemeral result of processing one work unit, serialized to the marker
/// file colocated with the folder. Never persisted to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub timestamp: DateTime<Utc>,
    pub folder_name: String,
    pub folder_path: PathBuf,
    pub json_upload: JsonUploadOutcome,
    pub image_upload: ImageUploadOutcome,
    pub summary: OutcomeSummary,
}

/// Outcome of the metadata (JSON) phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonUploadOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_upserted: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_preview: Option<String>,
}

impl JsonUploadOutcome {
    pub fn failure(
        filename: Option<String>,
        data_preview: Option<String>,
        err: &FolderError,
    ) -> Self {
        Self {
            success: false,
            filename,
            records_upserted: None,
            error: Some(OutcomeError::from_folder_error(err)),
            data_preview,
        }
    }
}

/// An error as recorded in the marker file, with its retryability
/// classification. Informational only; nothing retries in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeError {
    pub message: String,
    pub retryable: bool,
}

impl OutcomeError {
    pub fn from_folder_error(err: &FolderError) -> Self {
        Self {
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Outcome of the image phase. Counts cover attempted uploads only; when the
/// metadata phase fails, nothing is attempted and all counts stay zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageUploadOutcome {
    pub total_images: usize,
    pub successful_uploads: usize,
    pub failed_uploads: usize,
    pub uploaded_images: Vec<UploadedImage>,
    pub failures: Vec<FailedImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedImage {
    pub filename: String,
    pub storage_path: String,
    pub public_url: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedImage {
    pub filename: String,
    pub error: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub overall_success: bool,
    pub total_files_processed: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
}

impl UploadOutcome {
    /// A fresh outcome for a work unit, before any phase has run.
    pub fn new(unit: &WorkUnit) -> Self {
        Self {
            timestamp: Utc::now(),
            folder_name: unit.name.clone(),
            folder_path: unit.path.clone(),
            json_upload: JsonUploadOutcome {
                success: false,
                filename: None,
                records_upserted: None,
                error: None,
                data_preview: None,
            },
            image_upload: ImageUploadOutcome::default(),
            summary: OutcomeSummary::default(),
        }
    }

    /// Recompute the summary from the two phase outcomes. Overall success
    /// requires the metadata upsert to have succeeded and every attempted
    /// image upload to have succeeded; a folder with no images succeeds on
    /// metadata alone.
    pub fn finish(&mut self) {
        let json_ops = usize::from(self.json_upload.filename.is_some());
        self.summary = OutcomeSummary {
            overall_success: self.json_upload.success && self.image_upload.failed_uploads == 0,
            total_files_processed: json_ops + self.image_upload.total_images,
            successful_operations: usize::from(self.json_upload.success)
                + self.image_upload.successful_uploads,
            failed_operations: usize::from(!self.json_upload.success)
                + self.image_upload.failed_uploads,
        };
    }

    pub fn marker_filename(&self) -> &'static str {
        if self.summary.overall_success {
            SUCCESS_MARKER
        } else {
            FAILED_MARKER
        }
    }

    /// Serialize the outcome into the folder's marker file, overwriting any
    /// marker left by a previous run. Source files are never touched.
    pub fn write_marker(&self) -> anyhow::Result<PathBuf> {
        let path = self.folder_path.join(self.marker_filename());
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

/// First 200 characters of the payload, for the marker file.
pub fn data_preview(value: &serde_json::Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > 200 {
        let truncated: String = rendered.chars().take(200).collect();
        format!("{truncated}...")
    } else {
        rendered
    }
}
