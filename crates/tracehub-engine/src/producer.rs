//! Backfill request publishing.

use async_trait::async_trait;
use tokio::sync::mpsc;

use tracehub_core::BackfillEvent;

use crate::EngineError;

/// Publishes backfill requests for asynchronous processing.
#[async_trait]
pub trait BackfillProducer: Send + Sync {
    async fn send_backfill(&self, event: BackfillEvent) -> Result<(), EngineError>;
}

/// Producer backed by a bounded tokio channel.
#[derive(Clone)]
pub struct ChannelBackfillProducer {
    tx: mpsc::Sender<BackfillEvent>,
}

impl ChannelBackfillProducer {
    /// Create a producer and the receiving end its events are drained from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BackfillEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl BackfillProducer for ChannelBackfillProducer {
    async fn send_backfill(&self, event: BackfillEvent) -> Result<(), EngineError> {
        self.tx
            .send(event)
            .await
            .map_err(|e| EngineError::Producer(format!("backfill queue closed: {}", e.0.task_id)))
    }
}
