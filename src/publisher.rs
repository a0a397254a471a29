use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::db::{Database, DocumentRow};
use crate::envelope::Envelope;
use crate::error::SinkKind;
use crate::queue::DeliveryQueue;

/// Durable document store keyed by envelope id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, record: &DocumentRow) -> Result<()>;
}

#[async_trait]
impl RecordStore for Database {
    async fn put(&self, record: &DocumentRow) -> Result<()> {
        self.insert_document(record)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("record store write failed: {0:#}")]
    Store(anyhow::Error),
    #[error("queue send failed: {0:#}")]
    Queue(anyhow::Error),
}

impl PublishError {
    pub fn sink(&self) -> SinkKind {
        match self {
            PublishError::Store(_) => SinkKind::RecordStore,
            PublishError::Queue(_) => SinkKind::Queue,
        }
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            PublishError::Store(e) | PublishError::Queue(e) => e,
        }
    }
}

/// Writes an envelope to the record store, then to the delivery queue.
///
/// The two writes are independent: if the queue send fails after the store
/// write succeeded, the record stays and the caller retries the whole
/// sequence id later under a new envelope id.
pub struct Publisher {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn DeliveryQueue>,
}

impl Publisher {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        self.store
            .put(&envelope.to_record())
            .await
            .map_err(PublishError::Store)?;

        let body = serde_json::to_string(envelope).map_err(|e| PublishError::Queue(e.into()))?;
        self.queue.send(&body).await.map_err(PublishError::Queue)?;

        debug!(id = %envelope.id, queue = self.queue.name(), "published");
        Ok(())
    }
}
