use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{validate_traversal_id, CheckpointStore};
use crate::error::CheckpointResult;

/// In-process checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    live: Mutex<BTreeMap<String, Vec<u8>>>,
    archived: Mutex<Vec<(String, Vec<u8>)>>,
    saves: Mutex<u64>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived checkpoints in archive order.
    pub fn archived(&self) -> Vec<(String, Vec<u8>)> {
        self.archived
            .lock()
            .map(|archived| archived.clone())
            .unwrap_or_default()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.lock().map(|saves| *saves).unwrap_or_default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, traversal_id: &str, bytes: &[u8]) -> CheckpointResult<()> {
        validate_traversal_id(traversal_id)?;
        if let Ok(mut live) = self.live.lock() {
            live.insert(traversal_id.to_string(), bytes.to_vec());
        }
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }

    fn load(&self, traversal_id: &str) -> CheckpointResult<Option<Vec<u8>>> {
        validate_traversal_id(traversal_id)?;
        Ok(self
            .live
            .lock()
            .ok()
            .and_then(|live| live.get(traversal_id).cloned()))
    }

    fn archive(&self, traversal_id: &str) -> CheckpointResult<()> {
        validate_traversal_id(traversal_id)?;
        let removed = self
            .live
            .lock()
            .ok()
            .and_then(|mut live| live.remove(traversal_id));
        if let (Some(bytes), Ok(mut archived)) = (removed, self.archived.lock()) {
            archived.push((traversal_id.to_string(), bytes));
        }
        Ok(())
    }

    fn delete(&self, traversal_id: &str) -> CheckpointResult<()> {
        validate_traversal_id(traversal_id)?;
        if let Ok(mut live) = self.live.lock() {
            live.remove(traversal_id);
        }
        Ok(())
    }
}
