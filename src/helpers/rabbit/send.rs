use std::fmt::Debug;
use std::sync::Arc;

use amqprs::channel::BasicPublishArguments;
use amqprs::BasicProperties;
use anyhow::{Context, Result};
use serde::Serialize;

use super::confirm::ConfirmedChannel;

const PERSISTENT: u8 = 2;

/// Publishes JSON documents to one exchange. Cheap to share: the channel is only borrowed
/// for the duration of a single publish.
pub struct JsonSender {
    channel: Arc<ConfirmedChannel>,
    exchange_name: String,
    pretty_print: bool,
    mandatory: bool,
}

impl JsonSender {
    pub fn new(channel: Arc<ConfirmedChannel>, exchange_name: String, pretty_print: bool) -> Self {
        Self {
            channel,
            exchange_name,
            pretty_print,
            mandatory: false,
        }
    }

    /// With `mandatory`, unroutable messages fail the publish instead of being dropped by the broker.
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Returns once the broker confirmed the message.
    pub async fn publish<T: Serialize + Debug>(&self, routing_key: &str, msg: &T) -> Result<()> {
        let bin = if self.pretty_print {
            serde_json::to_vec_pretty(msg)
        } else {
            serde_json::to_vec(msg)
        }
        .with_context(|| format!("during serialisation of {:?}", msg))?;
        let args = BasicPublishArguments::new(&self.exchange_name, routing_key)
            .mandatory(self.mandatory)
            .finish();
        let props = BasicProperties::default()
            .with_content_type("application/json")
            .with_delivery_mode(PERSISTENT)
            .finish();
        self.channel
            .publish(props, bin, args)
            .await
            .with_context(|| format!("during publish to {}", self.exchange_name))?;
        Ok(())
    }
}
