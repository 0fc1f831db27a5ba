//! Checkpoint persistence.
//!
//! Stores hold the opaque bytes produced by [`TraversalState::serialize`],
//! keyed by traversal id. They never look inside.

mod file;
mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cursor::TraversalState;
use crate::error::{CheckpointError, CheckpointResult};

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// Storage for serialized traversal state.
pub trait CheckpointStore: Send + Sync + fmt::Debug {
    /// Replace the checkpoint for `traversal_id`.
    fn save(&self, traversal_id: &str, bytes: &[u8]) -> CheckpointResult<()>;

    /// Load the checkpoint for `traversal_id`, or `None` if there is none.
    fn load(&self, traversal_id: &str) -> CheckpointResult<Option<Vec<u8>>>;

    /// Move a finished traversal's checkpoint out of the way.
    fn archive(&self, traversal_id: &str) -> CheckpointResult<()>;

    /// Remove the checkpoint for `traversal_id`. Missing checkpoints are fine.
    fn delete(&self, traversal_id: &str) -> CheckpointResult<()>;
}

/// What to do when a stored checkpoint cannot be trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptCheckpointPolicy {
    /// Surface the error to the caller.
    #[default]
    Abort,
    /// Log it and start the traversal from empty state.
    RestartEmpty,
}

/// Reject ids that cannot safely name a single storage entry.
pub fn validate_traversal_id(traversal_id: &str) -> CheckpointResult<()> {
    let trimmed = traversal_id.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
        || trimmed.len() != traversal_id.len()
    {
        return Err(CheckpointError::InvalidTraversalId(traversal_id.to_string()));
    }
    Ok(())
}

/// Restore the saved state for `traversal_id`.
///
/// Returns `Ok(None)` when there is nothing to resume from, including when a
/// corrupt checkpoint is discarded under [`CorruptCheckpointPolicy::RestartEmpty`].
/// I/O failures always propagate.
pub fn resume_state(
    store: &dyn CheckpointStore,
    traversal_id: &str,
    policy: CorruptCheckpointPolicy,
) -> CheckpointResult<Option<TraversalState>> {
    let Some(bytes) = store.load(traversal_id)? else {
        return Ok(None);
    };

    match TraversalState::deserialize(&bytes) {
        Ok(state) => {
            info!(
                traversal_id,
                completed = state.completed_count(),
                pending = state.pending_count(),
                "resuming traversal from checkpoint"
            );
            Ok(Some(state))
        }
        Err(err) if err.is_corrupt() && policy == CorruptCheckpointPolicy::RestartEmpty => {
            warn!(traversal_id, error = %err, "discarding corrupt checkpoint");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
