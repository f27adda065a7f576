use anyhow::*;
use netprobe::helpers::rabbit::{ConfigureRabbit, RabbitHandle};

use super::Params;

const CONNECTION_NAME: &str = "probe-agent";

pub async fn prepare(params: &Params) -> Result<RabbitHandle> {
    let handle = RabbitHandle::connect(params.amqp_uri.as_str(), CONNECTION_NAME).await?;

    let queue_name = params.tasks_queue_name.as_str();
    let tasks_exchange_name = params.tasks_exchange_name.as_str();
    let exchange_type = params.exchange_type.as_str();
    let configure = ConfigureRabbit::new(&handle);

    configure
        .declare_exchange(tasks_exchange_name, exchange_type).await?
        .declare_exchange(&params.results_exchange_name, exchange_type).await?
        .declare_exchange(&params.logs_exchange_name, exchange_type).await?
        .declare_queue(queue_name).await?
        .bind_queue_routing(queue_name, tasks_exchange_name, &params.tasks_binding_key).await?
        .set_prefetch(params.prefetch).await?;

    Ok(handle)
}
