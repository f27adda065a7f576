use std::time::Duration;

use amqprs::callbacks::ChannelCallback;
use amqprs::channel::{BasicPublishArguments, Channel, ConfirmSelectArguments};
use amqprs::{Ack, BasicProperties, Cancel, CloseChannel, Nack, Return};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use super::RabbitHandle;

/// What the broker told us about a publish on a confirm channel.
#[derive(Debug, PartialEq, Eq)]
enum Confirm {
    Ack,
    Nack,
    /// Mandatory message could not be routed; an [Confirm::Ack] follows.
    Returned,
    Closed,
}

struct ConfirmCallback {
    confirms: UnboundedSender<Confirm>,
}

impl ConfirmCallback {
    fn forward(&self, confirm: Confirm) {
        // receiver only goes away together with the channel
        let _ = self.confirms.send(confirm);
    }
}

#[async_trait]
impl ChannelCallback for ConfirmCallback {
    async fn close(&mut self, channel: &Channel, close: CloseChannel) -> Result<(), amqprs::error::Error> {
        warn!("Publish channel {} closed by broker: {:?}", channel.channel_id(), close);
        self.forward(Confirm::Closed);
        Ok(())
    }

    async fn cancel(&mut self, _channel: &Channel, _cancel: Cancel) -> Result<(), amqprs::error::Error> {
        Ok(())
    }

    async fn flow(&mut self, _channel: &Channel, active: bool) -> Result<bool, amqprs::error::Error> {
        Ok(active)
    }

    async fn publish_ack(&mut self, _channel: &Channel, _ack: Ack) {
        self.forward(Confirm::Ack);
    }

    async fn publish_nack(&mut self, _channel: &Channel, _nack: Nack) {
        self.forward(Confirm::Nack);
    }

    async fn publish_return(
        &mut self,
        _channel: &Channel,
        _ret: Return,
        _basic_properties: BasicProperties,
        _content: Vec<u8>,
    ) {
        self.forward(Confirm::Returned);
    }
}

/// A channel in publisher-confirm mode. Publishes are serialised, so that each one
/// can wait for exactly its own confirmation.
pub struct ConfirmedChannel {
    handle: RabbitHandle,
    confirms: Mutex<UnboundedReceiver<Confirm>>,
    timeout: Duration,
}

impl ConfirmedChannel {
    pub async fn open(handle: RabbitHandle, timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle
            .chan()
            .register_callback(ConfirmCallback { confirms: tx })
            .await
            .context("while registering publish confirm callback")?;
        handle
            .chan()
            .confirm_select(ConfirmSelectArguments::default())
            .await
            .context("while enabling publisher confirms")?;
        Ok(Self {
            handle,
            confirms: Mutex::new(rx),
            timeout,
        })
    }

    /// Returns once the broker has taken responsibility for the message.
    pub async fn publish(
        &self,
        props: BasicProperties,
        content: Vec<u8>,
        args: BasicPublishArguments,
    ) -> Result<()> {
        let mut confirms = self.confirms.lock().await;
        // leftovers of an earlier publish that timed out
        while confirms.try_recv().is_ok() {}

        self.handle.chan().basic_publish(props, content, args).await?;
        tokio::time::timeout(self.timeout, await_confirm(&mut confirms))
            .await
            .map_err(|_| anyhow!("broker did not confirm within {:?}", self.timeout))?
    }
}

async fn await_confirm(confirms: &mut UnboundedReceiver<Confirm>) -> Result<()> {
    let mut returned = false;
    loop {
        match confirms.recv().await {
            Some(Confirm::Returned) => returned = true,
            Some(Confirm::Ack) if returned => bail!("message was not routed to any queue"),
            Some(Confirm::Ack) => return Ok(()),
            Some(Confirm::Nack) => bail!("broker rejected the message"),
            Some(Confirm::Closed) | None => bail!("channel closed before the message was confirmed"),
        }
    }
}
