use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result};
use queue_models::check_result::CheckResult;
use queue_models::log_entry::LogEntry;
use queue_models::KeyedMessage;
use serde::Serialize;

use super::RecordPublisher;

/// Ships results and task logs, each to their own exchange.
pub struct ResultRepository {
    results: Arc<dyn RecordPublisher>,
    logs: Arc<dyn RecordPublisher>,
}

impl ResultRepository {
    pub fn new(results: Arc<dyn RecordPublisher>, logs: Arc<dyn RecordPublisher>) -> Self {
        Self { results, logs }
    }

    pub async fn send_result(&self, result: &CheckResult) -> Result<()> {
        publish_keyed(self.results.as_ref(), result)
            .await
            .with_context(|| format!("failed to publish result of task {}", result.task_id))
    }

    pub async fn send_log(&self, entry: &LogEntry) -> Result<()> {
        publish_keyed(self.logs.as_ref(), entry)
            .await
            .with_context(|| format!("failed to publish log of task {}", entry.task_id))
    }
}

async fn publish_keyed<T>(publisher: &dyn RecordPublisher, msg: &T) -> Result<()>
where
    T: KeyedMessage + Serialize + Debug,
{
    let record = serde_json::to_value(msg).with_context(|| format!("during serialisation of {:?}", msg))?;
    publisher.publish(&msg.routing_key(), &record).await
}
