use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::executor;
use log::info;
use tokio_util::sync::CancellationToken;

use netprobe::helpers::stop::{self, flatten};
use netprobe::helpers::{bootstrap, logging};

use crate::agent::Agent;
use crate::checks::Registry;
use crate::repository::{ResultRepository, TaskRepository};

mod agent;
mod checks;
mod rabbit;
mod repository;

#[cfg(test)]
mod test_utils;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    logging: logging::Params,

    #[clap(flatten)]
    rabbit: rabbit::Params,

    #[clap(flatten)]
    agent: agent::Params,

    #[clap(flatten)]
    checks: checks::Params,
}

fn main() -> Result<()> {
    bootstrap::run(Cli::parse, |cli: &Cli| &cli.logging, do_run)
}

fn do_run(cli: Cli) -> Result<()> {
    let sig_handler = stop::new();
    let stop_rx = sig_handler.subscribe_stop();
    tokio::spawn(sig_handler.wait_for_signal());

    let agent_handle = tokio::spawn(run_agent(cli, stop_rx));
    executor::block_on(flatten(agent_handle))
}

async fn run_agent(cli: Cli, stop_rx: CancellationToken) -> Result<()> {
    let agent_id = cli.agent.agent_id.clone();
    let registry = Registry::from_params(&cli.checks, &agent_id).context("setting up checkers")?;
    let endpoints = rabbit::connect(&cli.rabbit, &agent_id)
        .await
        .context("connecting to RabbitMQ")?;

    let tasks = TaskRepository::new(
        endpoints.tasks,
        cli.agent.fetch_policy(),
        cli.agent.commit_policy(),
    );
    let results = ResultRepository::new(endpoints.results, endpoints.logs);
    let agent = Agent::new(&cli.agent, tasks, results, Arc::new(registry), stop_rx);

    let status = agent.status_handle();
    let res = agent.run().await;
    if let Err(health) = status.health_check() {
        info!("Agent stopped ({}): {:?}", health, status.status());
    }
    res
}
