use amqprs::channel::{BasicAckArguments, BasicNackArguments};
use anyhow::{Context, Result};

use super::RabbitHandle;

/// Acknowledges exactly one delivery. This MUST run on the same channel as the receiver,
/// otherwise Rabbit won't accept it.
pub async fn ack(handle: &RabbitHandle, delivery_tag: u64) -> Result<()> {
    handle
        .chan()
        .basic_ack(BasicAckArguments::new(delivery_tag, false))
        .await
        .with_context(|| format!("during ack of delivery {}", delivery_tag))?;
    Ok(())
}

/// Puts one delivery back into its queue. Same channel rule as for [ack].
pub async fn requeue(handle: &RabbitHandle, delivery_tag: u64) -> Result<()> {
    handle
        .chan()
        .basic_nack(BasicNackArguments::new(
            delivery_tag,
            /* multiple = */ false,
            /* requeue = */ true,
        ))
        .await
        .with_context(|| format!("during requeue of delivery {}", delivery_tag))?;
    Ok(())
}
