//! Pagination primitives: node ids, page info, cursor frames and paths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of an API entity (organization, member, repository).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// GraphQL connection `pageInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    #[serde(default)]
    pub end_cursor: Option<String>,
}

impl PageInfo {
    /// A final page.
    pub fn last() -> Self {
        Self {
            has_next_page: false,
            end_cursor: None,
        }
    }

    /// A page with more results after `cursor`.
    pub fn next(cursor: impl Into<String>) -> Self {
        Self {
            has_next_page: true,
            end_cursor: Some(cursor.into()),
        }
    }

    /// A page claiming more results must carry a cursor to reach them.
    pub fn is_well_formed(&self) -> bool {
        !self.has_next_page || self.end_cursor.is_some()
    }
}

/// Pagination position within one level of nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorFrame {
    pub level_name: String,
    /// `None` until the first page of this level has been fetched.
    pub page_info: Option<PageInfo>,
    /// Page size used for the most recent fetch of this level.
    pub page_size: u32,
    /// Entities received at this level so far.
    pub fetched_count: u64,
}

impl CursorFrame {
    /// A level that has not been fetched yet.
    pub fn unstarted(level_name: impl Into<String>, page_size: u32) -> Self {
        Self {
            level_name: level_name.into(),
            page_info: None,
            page_size,
            fetched_count: 0,
        }
    }

    pub fn is_started(&self) -> bool {
        self.page_info.is_some()
    }

    /// No further pages remain at this level.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self.page_info,
            Some(PageInfo {
                has_next_page: false,
                ..
            })
        )
    }

    /// Cursor to pass as `after` for the next page.
    pub fn next_cursor(&self) -> Option<&str> {
        self.page_info
            .as_ref()
            .and_then(|info| info.end_cursor.as_deref())
    }

    /// Record a freshly fetched page.
    pub fn advance(&mut self, page_info: PageInfo, page_size: u32, received: u64) {
        self.page_info = Some(page_info);
        self.page_size = page_size;
        self.fetched_count = self.fetched_count.saturating_add(received);
    }
}

/// Ordered nesting position, outermost level first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorPath(Vec<CursorFrame>);

impl CursorPath {
    pub fn new(frames: Vec<CursorFrame>) -> Self {
        Self(frames)
    }

    /// Unstarted frames for the given levels.
    pub fn unstarted<S: AsRef<str>>(levels: &[S], page_size: u32) -> Self {
        Self(
            levels
                .iter()
                .map(|level| CursorFrame::unstarted(level.as_ref(), page_size))
                .collect(),
        )
    }

    pub fn frames(&self) -> &[CursorFrame] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn frame(&self, level_name: &str) -> Option<&CursorFrame> {
        self.0.iter().find(|frame| frame.level_name == level_name)
    }

    pub fn frame_mut(&mut self, level_name: &str) -> Option<&mut CursorFrame> {
        self.0.iter_mut().find(|frame| frame.level_name == level_name)
    }

    /// The innermost frame, i.e. the one a fetch along this path advances.
    pub fn last(&self) -> Option<&CursorFrame> {
        self.0.last()
    }

    /// First level that still has pages to fetch.
    pub fn first_open(&self) -> Option<&CursorFrame> {
        self.0.iter().find(|frame| !frame.is_exhausted())
    }

    /// Every level has reached its last page.
    pub fn is_exhausted(&self) -> bool {
        self.0.iter().all(CursorFrame::is_exhausted)
    }
}
