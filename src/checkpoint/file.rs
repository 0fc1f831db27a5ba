use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use super::{validate_traversal_id, CheckpointStore};
use crate::error::{CheckpointError, CheckpointResult};

const CHECKPOINTS_DIR_NAME: &str = "checkpoints";
const ARCHIVE_DIR_NAME: &str = "archive";
const CHECKPOINT_EXTENSION: &str = "json";

/// Checkpoint store backed by the local filesystem.
///
/// Layout: `<base>/checkpoints/<id>.json`, archived copies under
/// `<base>/checkpoints/archive/<id>-<timestamp>.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root_dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `base_dir`, creating directories as needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> CheckpointResult<Self> {
        let root_dir = base_dir.into().join(CHECKPOINTS_DIR_NAME);
        fs::create_dir_all(root_dir.join(ARCHIVE_DIR_NAME))?;
        Ok(Self { root_dir })
    }

    /// Get the checkpoint root directory path.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Path of the live checkpoint for `traversal_id`.
    pub fn checkpoint_path(&self, traversal_id: &str) -> CheckpointResult<PathBuf> {
        validate_traversal_id(traversal_id)?;
        Ok(self
            .root_dir
            .join(format!("{traversal_id}.{CHECKPOINT_EXTENSION}")))
    }

    /// Archived checkpoints, oldest first.
    pub fn archived(&self) -> CheckpointResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(self.root_dir.join(ARCHIVE_DIR_NAME))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, traversal_id: &str, bytes: &[u8]) -> CheckpointResult<()> {
        let path = self.checkpoint_path(traversal_id)?;
        let temp_path = self
            .root_dir
            .join(format!("{traversal_id}.{CHECKPOINT_EXTENSION}.tmp"));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        debug!(traversal_id, path = %path.display(), bytes = bytes.len(), "checkpoint saved");
        Ok(())
    }

    fn load(&self, traversal_id: &str) -> CheckpointResult<Option<Vec<u8>>> {
        let path = self.checkpoint_path(traversal_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CheckpointError::Io(err)),
        }
    }

    fn archive(&self, traversal_id: &str) -> CheckpointResult<()> {
        let path = self.checkpoint_path(traversal_id)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let archived = self
            .root_dir
            .join(ARCHIVE_DIR_NAME)
            .join(format!("{traversal_id}-{stamp}.{CHECKPOINT_EXTENSION}"));

        match fs::rename(&path, &archived) {
            Ok(()) => {
                debug!(traversal_id, path = %archived.display(), "checkpoint archived");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CheckpointError::Io(err)),
        }
    }

    fn delete(&self, traversal_id: &str) -> CheckpointResult<()> {
        let path = self.checkpoint_path(traversal_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CheckpointError::Io(err)),
        }
    }
}
