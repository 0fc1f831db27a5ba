//! Downstream entity sinks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::cursor::NodeId;
use crate::entity::{EmittedEntity, EntityKind};
use crate::error::SinkError;

/// Receives entities as the traversal materializes them.
#[async_trait]
pub trait EntitySink: Send {
    async fn emit(&mut self, entity: EmittedEntity) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards entities over a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<EmittedEntity>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EmittedEntity>) -> Self {
        Self { tx }
    }

    /// A sink together with the receiving half of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EmittedEntity>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EntitySink for ChannelSink {
    async fn emit(&mut self, entity: EmittedEntity) -> Result<(), SinkError> {
        self.tx.send(entity).await.map_err(|_| SinkError::Closed)
    }
}

#[derive(Serialize)]
struct Line<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
    kind: EntityKind,
    id: &'a NodeId,
    payload: &'a Value,
}

/// Writes one JSON object per line.
///
/// Clones share the writer, so several traversals can write to the same
/// stream without interleaving partial lines.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: Arc<Mutex<W>>,
    organization: Option<String>,
}

impl<W> Clone for JsonLinesSink<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            organization: self.organization.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            organization: None,
        }
    }

    /// A sink sharing this writer that tags every line with `organization`.
    pub fn for_organization(&self, organization: impl Into<String>) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            organization: Some(organization.into()),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EntitySink for JsonLinesSink<W> {
    async fn emit(&mut self, entity: EmittedEntity) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&Line {
            organization: self.organization.as_deref(),
            kind: entity.kind,
            id: &entity.id,
            payload: &entity.payload,
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo(id: &str) -> EmittedEntity {
        EmittedEntity {
            kind: EntityKind::Repository,
            id: id.into(),
            payload: json!({"name": id}),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (mut sink, mut rx) = ChannelSink::channel(4);
        sink.emit(repo("R1")).await.unwrap();

        assert_eq!(rx.recv().await, Some(repo("R1")));
    }

    #[tokio::test]
    async fn test_channel_sink_closed() {
        let (mut sink, rx) = ChannelSink::channel(1);
        drop(rx);

        assert!(matches!(sink.emit(repo("R1")).await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn test_json_lines_sink_tags_organization() {
        let root = JsonLinesSink::new(Vec::<u8>::new());
        let mut acme = root.for_organization("acme");
        let mut plain = root.clone();

        acme.emit(repo("R1")).await.unwrap();
        plain.emit(repo("R2")).await.unwrap();
        acme.flush().await.unwrap();

        let bytes = root.writer.lock().await.clone();
        let lines: Vec<Value> = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(
            lines[0],
            json!({"organization": "acme", "kind": "repository", "id": "R1", "payload": {"name": "R1"}})
        );
        assert_eq!(
            lines[1],
            json!({"kind": "repository", "id": "R2", "payload": {"name": "R2"}})
        );
    }
}
