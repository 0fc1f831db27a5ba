//! Test doubles for traversals.
//!
//! Provides deterministic doubles for testing engines without a network:
//!
//! - [`FixtureFetcher`]: serves pages from an in-memory organization tree,
//!   with scripted failures and a record of every call
//! - [`CollectingSink`]: keeps every emitted entity for inspection
//! - [`ManualClock`]: a clock tests advance by hand

mod fixture;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::engine::EntitySink;
use crate::entity::{EmittedEntity, EntityKind};
use crate::error::SinkError;

pub use crate::budget::ManualClock;
pub use fixture::{FetchCall, FixtureFetcher, FixtureMember, FixtureTree};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sink that keeps everything it receives. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    entities: Arc<Mutex<Vec<EmittedEntity>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far, in emission order.
    pub fn entities(&self) -> Vec<EmittedEntity> {
        lock(&self.entities).clone()
    }

    /// Ids of the emitted entities of `kind`, in emission order.
    pub fn ids_of(&self, kind: EntityKind) -> Vec<String> {
        lock(&self.entities)
            .iter()
            .filter(|entity| entity.kind == kind)
            .map(|entity| entity.id.to_string())
            .collect()
    }

    pub fn find(&self, kind: EntityKind, id: &str) -> Option<EmittedEntity> {
        lock(&self.entities)
            .iter()
            .find(|entity| entity.kind == kind && entity.id.as_str() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntitySink for CollectingSink {
    async fn emit(&mut self, entity: EmittedEntity) -> Result<(), SinkError> {
        lock(&self.entities).push(entity);
        Ok(())
    }
}
