use std::marker::PhantomData;

use amqprs::channel::{BasicConsumeArguments, BasicRejectArguments, ConsumerMessage};
// Cannot * due to Ok()
use anyhow::{Context, Result};
use log::{log_enabled, trace, warn, Level};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::RabbitHandle;

#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("stop requested while waiting for a message")]
    Cancelled,

    #[error("no message arrived before the deadline")]
    DeadlineExceeded,

    #[error("delivery stream of queue `{0}` was closed, channel or connection is gone")]
    ChannelClosed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A parsed message together with what is needed to acknowledge it later.
#[derive(Debug)]
pub struct Received<Model> {
    pub model: Model,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Pull-style JSON consumer: messages are taken one by one via [JsonReceiver::next] instead of
/// being pushed to a handler. Messages that don't parse are rejected (without requeue) and
/// skipped, so a poison message can't block the queue.
pub struct JsonReceiver<Model> {
    queue_name: String,
    rabbit_rx: UnboundedReceiver<ConsumerMessage>,
    _model: PhantomData<fn() -> Model>,
}

impl<Model: DeserializeOwned> JsonReceiver<Model> {
    /// Starts consuming. Acks and rejects for the deliveries MUST go over the same handle,
    /// otherwise RabbitMQ won't accept them.
    pub async fn start(handle: &RabbitHandle, queue_name: String, consumer_tag: &str) -> Result<Self> {
        let consume_args = BasicConsumeArguments::new(&queue_name, consumer_tag);
        let (_, rabbit_rx) = handle
            .chan()
            .basic_consume_rx(consume_args)
            .await
            .with_context(|| format!("while starting consumer on {}", queue_name))?;
        Ok(Self {
            queue_name,
            rabbit_rx,
            _model: PhantomData,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Waits for the next parseable message until `deadline` or until `stop_rx` fires.
    pub async fn next(
        &mut self,
        handle: &RabbitHandle,
        stop_rx: &CancellationToken,
        deadline: Instant,
    ) -> Result<Received<Model>, ReceiveError> {
        loop {
            let msg = select! {
                biased; // Stop should take prio
                _ = stop_rx.cancelled() => return Err(ReceiveError::Cancelled),
                _ = sleep_until(deadline) => return Err(ReceiveError::DeadlineExceeded),
                msg_opt = self.rabbit_rx.recv() => match msg_opt {
                    Some(msg) => msg,
                    None => return Err(ReceiveError::ChannelClosed(self.queue_name.clone())),
                },
            };
            if let Some(received) = self.parse_or_reject(handle, msg).await? {
                return Ok(received);
            }
        }
    }

    async fn parse_or_reject(
        &self,
        handle: &RabbitHandle,
        msg: ConsumerMessage,
    ) -> Result<Option<Received<Model>>> {
        // NOTE: By default, if a msg is un-ack'd for 30min, the consumer
        // is assumed faulty and the channel is closed with an error.
        // https://www.rabbitmq.com/consumers.html#acknowledgement-timeout
        let (content, deliver) = match (msg.content, msg.deliver) {
            (Some(content), Some(deliver)) => (content, deliver),
            (_, deliver) => {
                warn!("Incomplete delivery from {}, skipping: {:?}", self.queue_name, deliver);
                return Ok(None);
            }
        };
        let content_slice = content.as_slice();
        if log_enabled!(Level::Trace) {
            trace!("Got from RabbitMQ: {:?}", try_parse_utf8(content_slice));
        }
        match serde_json::from_slice(content_slice) {
            Ok(model) => Ok(Some(Received {
                model,
                delivery_tag: deliver.delivery_tag(),
                redelivered: deliver.redelivered(),
            })),
            Err(e) => {
                warn!(
                    "Unable to parse RabbitMQ message: {:?} - {:?} (reject to drop)",
                    e,
                    try_parse_utf8(content_slice)
                );
                reject(handle, deliver.delivery_tag()).await?;
                Ok(None)
            }
        }
    }
}

fn try_parse_utf8(content: &[u8]) -> &str {
    match std::str::from_utf8(content) {
        Ok(parsed) => parsed,
        Err(_) => "<< not UTF-8 >>",
    }
}

/// Drops a message for good, i.e. it will not be redelivered.
pub async fn reject(handle: &RabbitHandle, delivery_tag: u64) -> Result<()> {
    handle
        .chan()
        .basic_reject(BasicRejectArguments::new(
            delivery_tag,
            /* requeue = */ false,
        ))
        .await
        .context("during immediate reject")?;
    Ok(())
}
