//! Cursor state for nested pagination.
//!
//! A traversal's position is an outer [`CursorFrame`] plus, for every outer
//! entity still being paginated, a [`CursorPath`] over its inner levels. The
//! whole thing lives in [`TraversalState`], which serializes to checkpoint
//! bytes and back without loss.

mod codec;
mod page;
mod state;

pub use codec::CHECKPOINT_FORMAT_VERSION;
pub use page::{CursorFrame, CursorPath, NodeId, PageInfo};
pub use state::{FetchTarget, OuterEntry, TraversalState};
