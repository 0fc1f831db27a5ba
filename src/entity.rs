//! Entities produced by a traversal.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cursor::NodeId;

/// Kind of entity returned by the API. Node ids are unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Member,
    Repository,
}

impl EntityKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            EntityKind::Member => "member",
            EntityKind::Repository => "repository",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// De-duplication key: node ids are only unique within a kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: NodeId,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<NodeId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// One entity as returned inside a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedEntity {
    pub kind: EntityKind,
    pub id: NodeId,
    pub payload: Value,
    /// Attributes of the link from the scoping parent to this entity, such as
    /// a member's permission on a repository. Kept on the parent, not emitted
    /// with the entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<Value>,
}

impl FetchedEntity {
    pub fn new(kind: EntityKind, id: impl Into<NodeId>, payload: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            payload,
            edge: None,
        }
    }

    pub fn with_edge(mut self, edge: Value) -> Self {
        self.edge = Some(edge);
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }
}

/// An entity handed to the downstream sink. Emitted at most once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEntity {
    pub kind: EntityKind,
    pub id: NodeId,
    pub payload: Value,
}

impl EmittedEntity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }
}

impl From<FetchedEntity> for EmittedEntity {
    fn from(entity: FetchedEntity) -> Self {
        Self {
            kind: entity.kind,
            id: entity.id,
            payload: entity.payload,
        }
    }
}
