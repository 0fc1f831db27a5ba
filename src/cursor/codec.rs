//! Checkpoint encoding for [`TraversalState`].
//!
//! Bytes are a JSON envelope carrying a format version, a SHA-256 checksum and
//! the state itself as embedded JSON text, so the checksummed bytes survive the
//! envelope round trip untouched. The layout is opaque to storage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::state::TraversalState;
use crate::error::{CheckpointError, CheckpointResult};

/// Current checkpoint format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    checksum: String,
    state: String,
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl TraversalState {
    /// Encode the state for checkpointing.
    pub fn serialize(&self) -> CheckpointResult<Vec<u8>> {
        let state = serde_json::to_string(self)?;
        let envelope = Envelope {
            format_version: CHECKPOINT_FORMAT_VERSION,
            checksum: checksum(state.as_bytes()),
            state,
        };
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// Decode and verify a checkpoint produced by [`TraversalState::serialize`].
    pub fn deserialize(bytes: &[u8]) -> CheckpointResult<TraversalState> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: envelope.format_version,
                supported: CHECKPOINT_FORMAT_VERSION,
            });
        }

        let actual = checksum(envelope.state.as_bytes());
        if actual != envelope.checksum {
            return Err(CheckpointError::ChecksumMismatch {
                expected: envelope.checksum,
                actual,
            });
        }

        Ok(serde_json::from_str(&envelope.state)?)
    }
}
