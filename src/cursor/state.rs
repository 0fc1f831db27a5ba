//! Resumable traversal state.
//!
//! The nested pagination tree is flattened into a FIFO work queue of outer
//! entities, each carrying its own inner [`CursorPath`]. Nothing here performs
//! I/O; every mutation is driven by the engine after a successful fetch.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::page::{CursorFrame, CursorPath, NodeId, PageInfo};
use crate::entity::EntityKey;

/// Which cursor a fetch advances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "target")]
pub enum FetchTarget {
    /// The outer list itself (e.g. organization members).
    Outer,
    /// One inner list scoped to a single known outer entity.
    Inner { parent: NodeId, level: String },
}

/// An outer entity whose inner levels are not yet fully paginated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OuterEntry {
    pub id: NodeId,
    pub payload: Value,
    /// One frame per inner level, in fetch order.
    pub path: CursorPath,
    /// Child node ids gathered so far, per inner level.
    pub children: BTreeMap<String, Vec<NodeId>>,
    /// Link attributes per inner level, keyed by child id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edges: BTreeMap<String, BTreeMap<NodeId, Value>>,
}

impl OuterEntry {
    fn new(id: NodeId, payload: Value, inner_levels: &[String]) -> Self {
        Self {
            id,
            payload,
            path: CursorPath::unstarted(inner_levels, 0),
            children: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Inner frame that the next fetch for this entity should advance.
    pub fn open_frame(&self) -> Option<&CursorFrame> {
        self.path.first_open()
    }

    pub fn is_exhausted(&self) -> bool {
        self.path.is_exhausted()
    }
}

/// Full resumable snapshot of one traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalState {
    outer: CursorFrame,
    inner_levels: Vec<String>,
    pending: VecDeque<OuterEntry>,
    completed: BTreeSet<NodeId>,
    emitted: BTreeSet<EntityKey>,
    head_streak: u32,
}

impl TraversalState {
    /// Empty state at the start of a traversal.
    pub fn new(outer_level: impl Into<String>, inner_levels: Vec<String>) -> Self {
        Self {
            outer: CursorFrame::unstarted(outer_level, 0),
            inner_levels,
            pending: VecDeque::new(),
            completed: BTreeSet::new(),
            emitted: BTreeSet::new(),
            head_streak: 0,
        }
    }

    pub fn outer(&self) -> &CursorFrame {
        &self.outer
    }

    pub fn inner_levels(&self) -> &[String] {
        &self.inner_levels
    }

    /// Register an outer entity seen in an outer page.
    ///
    /// Returns `false` if the entity is already queued or complete.
    pub fn discover(&mut self, id: NodeId, payload: Value) -> bool {
        if self.completed.contains(&id) || self.pending.iter().any(|entry| entry.id == id) {
            return false;
        }
        self.pending
            .push_back(OuterEntry::new(id, payload, &self.inner_levels));
        true
    }

    /// Record a fetched page against the cursor named by `target`.
    ///
    /// Returns `false` when the target no longer exists (e.g. the parent is
    /// already complete), in which case nothing changes.
    pub fn advance(
        &mut self,
        target: &FetchTarget,
        page_info: PageInfo,
        page_size: u32,
        received: u64,
    ) -> bool {
        match target {
            FetchTarget::Outer => {
                self.outer.advance(page_info, page_size, received);
                true
            }
            FetchTarget::Inner { parent, level } => {
                let Some(frame) = self
                    .entry_mut(parent)
                    .and_then(|entry| entry.path.frame_mut(level))
                else {
                    return false;
                };
                frame.advance(page_info, page_size, received);
                true
            }
        }
    }

    /// Attach a child id to an outer entity's inner level.
    pub fn record_child(&mut self, parent: &NodeId, level: &str, child: NodeId) {
        if let Some(entry) = self.entry_mut(parent) {
            let children = entry.children.entry(level.to_string()).or_default();
            if !children.contains(&child) {
                children.push(child);
            }
        }
    }

    /// Attach link attributes for a child of an outer entity's inner level.
    pub fn record_edge(&mut self, parent: &NodeId, level: &str, child: NodeId, edge: Value) {
        if let Some(entry) = self.entry_mut(parent) {
            entry
                .edges
                .entry(level.to_string())
                .or_default()
                .insert(child, edge);
        }
    }

    /// Move an outer entity to the completed set.
    ///
    /// Completion is monotonic; returns the entry only the first time.
    pub fn mark_entity_complete(&mut self, id: &NodeId) -> Option<OuterEntry> {
        if self.completed.contains(id) {
            return None;
        }
        let position = self.pending.iter().position(|entry| &entry.id == id)?;
        if position == 0 {
            self.head_streak = 0;
        }
        let entry = self.pending.remove(position)?;
        self.completed.insert(entry.id.clone());
        Some(entry)
    }

    /// Drop a queued outer entity without emitting it.
    ///
    /// The id joins the completed set so a later outer page cannot queue it
    /// again. Children already emitted stay emitted.
    pub fn abandon(&mut self, id: &NodeId) -> Option<OuterEntry> {
        let position = self.pending.iter().position(|entry| &entry.id == id)?;
        if position == 0 {
            self.head_streak = 0;
        }
        let entry = self.pending.remove(position)?;
        self.completed.insert(entry.id.clone());
        Some(entry)
    }

    /// Next outer entity with unfinished inner pagination, in discovery order.
    pub fn next_incomplete_outer_entity(&self) -> Option<&NodeId> {
        self.pending.front().map(|entry| &entry.id)
    }

    /// The entry at the head of the work queue.
    pub fn head(&self) -> Option<&OuterEntry> {
        self.pending.front()
    }

    /// Incomplete outer entities in queue order.
    pub fn pending(&self) -> impl Iterator<Item = &OuterEntry> {
        self.pending.iter()
    }

    pub fn entry(&self, id: &NodeId) -> Option<&OuterEntry> {
        self.pending.iter().find(|entry| &entry.id == id)
    }

    fn entry_mut(&mut self, id: &NodeId) -> Option<&mut OuterEntry> {
        self.pending.iter_mut().find(|entry| &entry.id == id)
    }

    /// Count a page taken from the head entity.
    pub fn note_head_page(&mut self) {
        self.head_streak = self.head_streak.saturating_add(1);
    }

    /// Consecutive pages taken from the current head entity.
    pub fn head_streak(&self) -> u32 {
        self.head_streak
    }

    /// Send the head entity to the back of the queue.
    pub fn rotate_head(&mut self) {
        if let Some(entry) = self.pending.pop_front() {
            self.pending.push_back(entry);
        }
        self.head_streak = 0;
    }

    /// Record that an entity was handed to the sink.
    ///
    /// Returns `false` if it had already been emitted.
    pub fn mark_emitted(&mut self, key: EntityKey) -> bool {
        self.emitted.insert(key)
    }

    pub fn is_emitted(&self, key: &EntityKey) -> bool {
        self.emitted.contains(key)
    }

    pub fn is_complete_entity(&self, id: &NodeId) -> bool {
        self.completed.contains(id)
    }

    /// The outer list has been paged to its end.
    pub fn is_outer_exhausted(&self) -> bool {
        self.outer.is_exhausted()
    }

    /// Terminal completion: nothing left to fetch at any level.
    pub fn is_complete(&self) -> bool {
        self.is_outer_exhausted() && self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }
}
