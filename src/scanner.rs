use crate::error::ScanError;
use crate::outcome::SUCCESS_MARKER;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// One candidate subfolder: a single device's test data plus its images.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Folder name, unique within the run
    pub name: String,
    /// Absolute or root-relative path to the folder
    pub path: PathBuf,
    /// Last modification time, used for processing order
    pub modified: SystemTime,
}

/// Whether a folder has already been processed. A pure function of filesystem
/// state: true iff the folder contains a success marker. Failure markers do
/// not count — re-running the tool is the retry mechanism.
pub fn is_processed(path: &Path) -> bool {
    path.join(SUCCESS_MARKER).is_file()
}

/// Enumerates work units under a root path. Holds no state of its own; the
/// skip decision is derived entirely from marker files on disk, so scans are
/// restartable across runs.
pub struct FolderScanner {
    root: PathBuf,
}

impl FolderScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Discover unprocessed subfolders, ordered by descending modification
    /// time (freshest data first). Fails only if the root itself cannot be
    /// read; unreadable subfolders are skipped with a warning.
    pub fn discover(&self) -> Result<Vec<WorkUnit>, ScanError> {
        if !self.root.exists() {
            return Err(ScanError::RootNotFound(self.root.clone()));
        }
        if !self.root.is_dir() {
            return Err(ScanError::NotADirectory(self.root.clone()));
        }

        let mut units = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();

            if is_processed(&path) {
                info!(folder = %name, "skipping already-processed folder");
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!(folder = %name, error = %e, "skipping unreadable folder");
                    continue;
                }
            };

            debug!(folder = %name, "discovered folder");
            units.push(WorkUnit {
                name,
                path,
                modified,
            });
        }

        sort_newest_first(&mut units);

        info!(count = units.len(), "found subfolders to process");
        Ok(units)
    }
}

/// Most recently touched folders first.
pub fn sort_newest_first(units: &mut [WorkUnit]) {
    units.sort_by(|a, b| b.modified.cmp(&a.modified));
}
