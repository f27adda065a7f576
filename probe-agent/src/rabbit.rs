use std::sync::Arc;
use std::time::Duration;

use anyhow::*;
use clap::Args;
use log::info;
use netprobe::helpers::rabbit::confirm::ConfirmedChannel;
use netprobe::helpers::rabbit::send::JsonSender;

use crate::repository::{RecordPublisher, TaskConsumer};

pub use consumer::RabbitTaskConsumer;
pub use producer::RabbitPublisher;

mod consumer;
/// Handles connection setup and topology.
mod prepare;
mod producer;

#[derive(Args, Debug)]
#[group(id = "rabbit")]
pub struct Params {
    /// URI for AMQP (RabbitMQ) server to connect to.
    /// Environment variable: AMQP_URI
    /// If a password is required, it is recommended to specify the URL over the environment or
    /// a config file, to avoid exposure in shell history and process list.
    #[arg(long, env = "AMQP_URI")]
    amqp_uri: String,

    /// Name of the exchange tasks are published to.
    #[arg(long, env = "TASKS_EXCHANGE", default_value = "netprobe.tasks")]
    tasks_exchange_name: String,

    /// Queue to consume tasks from. Agents sharing the name split the tasks among them.
    #[arg(long, env = "TASKS_QUEUE", default_value = "netprobe.tasks.agents")]
    tasks_queue_name: String,

    /// Routing key binding the task queue to the tasks exchange.
    #[arg(long, env = "TASKS_BINDING_KEY", default_value = "#")]
    tasks_binding_key: String,

    /// Name of the exchange to publish results to, routed by task id.
    #[arg(long, env = "RESULTS_EXCHANGE", default_value = "netprobe.results")]
    results_exchange_name: String,

    /// Name of the exchange to publish task logs to.
    #[arg(long, env = "LOGS_EXCHANGE", default_value = "netprobe.logs")]
    logs_exchange_name: String,

    /// Type of all three exchanges.
    #[arg(long, env = "EXCHANGE_TYPE", default_value = "topic")]
    exchange_type: String,

    /// How many un-acked tasks the broker may hand to this agent at once.
    #[arg(long, env = "TASKS_PREFETCH", default_value = "100")]
    prefetch: u16,

    /// How long to wait for the broker to confirm a published result or log, in seconds.
    #[arg(long, env = "PUBLISH_CONFIRM_TIMEOUT_SECS", default_value = "10")]
    publish_confirm_timeout_secs: u64,

    /// Fail result publishes that no queue is bound for, so the task is redelivered.
    /// Only enable once a consumer has bound its queue to the results exchange.
    #[arg(long, env = "RESULTS_MANDATORY")]
    results_mandatory: bool,

    /// Pretty-print outgoing JSON (for debugging).
    #[arg(long, env = "PRETTY_PRINT")]
    pretty_print: bool,
}

/// Both ends of the queue, ready for the repositories.
pub struct Endpoints {
    pub tasks: Arc<dyn TaskConsumer>,
    pub results: Arc<dyn RecordPublisher>,
    pub logs: Arc<dyn RecordPublisher>,
}

/// Connects, declares the topology and starts consuming. Failures here are fatal for the agent.
pub async fn connect(params: &Params, consumer_tag: &str) -> Result<Endpoints> {
    let consume_handle = prepare::prepare(params).await?;
    // results and logs share one channel, separate from the consumer
    let publish_channel = ConfirmedChannel::open(
        consume_handle.fork().await?,
        Duration::from_secs(params.publish_confirm_timeout_secs),
    )
    .await?;
    let publish_channel = Arc::new(publish_channel);

    let tasks = RabbitTaskConsumer::start(consume_handle, params.tasks_queue_name.clone(), consumer_tag)
        .await
        .context("while starting task consumer")?;
    let results = RabbitPublisher::new(
        JsonSender::new(
            publish_channel.clone(),
            params.results_exchange_name.clone(),
            params.pretty_print,
        )
        .mandatory(params.results_mandatory),
    );
    let logs = RabbitPublisher::new(JsonSender::new(
        publish_channel,
        params.logs_exchange_name.clone(),
        params.pretty_print,
    ));
    info!(
        "Consuming tasks from {} as {}, publishing to {} and {}",
        params.tasks_queue_name, consumer_tag, params.results_exchange_name, params.logs_exchange_name
    );
    Ok(Endpoints {
        tasks: Arc::new(tasks),
        results: Arc::new(results),
        logs: Arc::new(logs),
    })
}
