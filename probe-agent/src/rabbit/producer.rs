use anyhow::Result;
use async_trait::async_trait;
use log::trace;
use netprobe::helpers::rabbit::send::JsonSender;
use serde_json::Value;

use crate::repository::RecordPublisher;

pub struct RabbitPublisher {
    sender: JsonSender,
}

impl RabbitPublisher {
    pub fn new(sender: JsonSender) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl RecordPublisher for RabbitPublisher {
    async fn publish(&self, routing_key: &str, record: &Value) -> Result<()> {
        trace!("Publishing to {} with key {}", self.sender.exchange_name(), routing_key);
        self.sender.publish(routing_key, record).await
    }
}
