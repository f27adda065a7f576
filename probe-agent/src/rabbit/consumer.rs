use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use netprobe::helpers::rabbit::ack::{ack, requeue};
use netprobe::helpers::rabbit::receive::{reject, JsonReceiver};
use netprobe::helpers::rabbit::RabbitHandle;
use queue_models::task::Task;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::repository::{FetchError, TaskConsumer};

/// Pulls tasks from the task queue. Acks go over the channel the tasks arrived on.
pub struct RabbitTaskConsumer {
    handle: RabbitHandle,
    receiver: Mutex<JsonReceiver<Task>>,
}

impl RabbitTaskConsumer {
    pub async fn start(handle: RabbitHandle, queue_name: String, consumer_tag: &str) -> Result<Self> {
        let receiver = JsonReceiver::start(&handle, queue_name, consumer_tag).await?;
        Ok(Self {
            handle,
            receiver: Mutex::new(receiver),
        })
    }
}

#[async_trait]
impl TaskConsumer for RabbitTaskConsumer {
    async fn fetch(
        &self,
        stop_rx: &CancellationToken,
        deadline: Instant,
    ) -> Result<(Task, u64), FetchError> {
        let mut receiver = self.receiver.lock().await;
        loop {
            let received = receiver.next(&self.handle, stop_rx, deadline).await?;
            if received.model.id.is_empty() {
                warn!("Dropping task without id from {}: {:?}", receiver.queue_name(), received.model);
                reject(&self.handle, received.delivery_tag).await?;
                continue;
            }
            if received.redelivered {
                debug!("Task {} is a redelivery", received.model.id);
            }
            return Ok((received.model, received.delivery_tag));
        }
    }

    async fn commit(&self, delivery_tag: u64) -> Result<()> {
        ack(&self.handle, delivery_tag).await
    }

    async fn release(&self, delivery_tag: u64) -> Result<()> {
        requeue(&self.handle, delivery_tag).await
    }
}
