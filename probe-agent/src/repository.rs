use anyhow::Result;
use async_trait::async_trait;
use netprobe::helpers::rabbit::receive::ReceiveError;
use queue_models::task::Task;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use result::ResultRepository;
pub use task::{CommitPolicy, FetchPolicy, TaskRepository};

mod result;
mod task;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("stop requested while fetching tasks")]
    Cancelled,

    #[error("no task arrived before the fetch deadline")]
    DeadlineExceeded,

    #[error("task delivery stream is closed: {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ReceiveError> for FetchError {
    fn from(value: ReceiveError) -> Self {
        match value {
            ReceiveError::Cancelled => FetchError::Cancelled,
            ReceiveError::DeadlineExceeded => FetchError::DeadlineExceeded,
            ReceiveError::ChannelClosed(queue) => FetchError::ChannelClosed(queue),
            ReceiveError::Other(e) => FetchError::Other(e),
        }
    }
}

/// Source of tasks. Every fetched task comes with the delivery tag needed to commit it.
#[async_trait]
pub trait TaskConsumer: Send + Sync {
    async fn fetch(
        &self,
        stop_rx: &CancellationToken,
        deadline: Instant,
    ) -> Result<(Task, u64), FetchError>;

    /// Marks the delivery as done for good. May fail transiently.
    async fn commit(&self, delivery_tag: u64) -> Result<()>;

    /// Hands the delivery back to the broker for redelivery, freeing its prefetch slot.
    async fn release(&self, delivery_tag: u64) -> Result<()>;
}

/// Sink for outgoing JSON records on one exchange.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(&self, routing_key: &str, record: &Value) -> Result<()>;
}
