use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use log::{debug, info, warn};
use queue_models::check_result::CheckResult;
use queue_models::task::{Parameters, TaskType};
use tokio::select;
use tokio_util::sync::CancellationToken;

pub use probe::{ProbeEnd, ProbeExecutor, ProbeOutput, SystemExecutor};

pub mod dns;
pub mod http;
pub mod params;
pub mod ping;
pub mod probe;
pub mod target;
pub mod tcp;
pub mod traceroute;

#[derive(Args, Debug, Clone)]
#[group(id = "checks")]
pub struct Params {
    /// Location tag reported in every payload. Defaults to the agent id.
    #[arg(long, env = "AGENT_LOCATION")]
    location: Option<String>,

    /// Country tag reported in every payload.
    #[arg(long, env = "AGENT_COUNTRY", default_value = "unknown")]
    country: String,

    /// Default HTTP request timeout, in seconds
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "10")]
    http_timeout_secs: u64,

    /// Default TCP connect timeout, in seconds
    #[arg(long, env = "TCP_TIMEOUT_SECS", default_value = "5")]
    tcp_timeout_secs: u64,

    /// Default ping deadline, in seconds
    #[arg(long, env = "PING_TIMEOUT_SECS", default_value = "5")]
    ping_timeout_secs: u64,

    /// Default number of echo requests per ping check
    #[arg(long, env = "PING_COUNT", default_value = "4")]
    ping_count: u32,

    #[arg(long, env = "TRACEROUTE_MAX_HOPS", default_value = "30")]
    traceroute_max_hops: u32,

    /// Default time to wait for each traceroute hop, in seconds
    #[arg(long, env = "TRACEROUTE_HOP_TIMEOUT_SECS", default_value = "3")]
    traceroute_hop_timeout_secs: u64,

    /// Default DNS lookup timeout, in seconds
    #[arg(long, env = "DNS_TIMEOUT_SECS", default_value = "5")]
    dns_timeout_secs: u64,

    /// Path of the ping binary used for ping & traceroute checks
    #[arg(long, env = "PING_BIN_PATH", default_value = "ping")]
    ping_bin_path: String,

    /// Task types not to serve on this host, e.g. `ping,traceroute` without raw socket access.
    #[arg(long, env = "DISABLED_CHECKERS", value_delimiter = ',')]
    disabled_checkers: Vec<String>,
}

/// Where this agent is, as reported in payloads. Tasks may override both per check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub location: String,
    pub country: String,
}

impl Metadata {
    pub fn location_for(&self, params: &Parameters) -> String {
        params::string_param(params, "location", &self.location)
    }

    pub fn country_for(&self, params: &Parameters) -> String {
        params::string_param(params, "country", &self.country)
    }
}

/// One diagnostic protocol. Target-side failures are reported in the returned [CheckResult];
/// `Err` is reserved for faults of the agent itself.
#[async_trait]
pub trait Checker: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn check(
        &self,
        target: &str,
        params: &Parameters,
        stop_rx: &CancellationToken,
    ) -> Result<CheckResult>;
}

/// Immutable after startup.
#[derive(Default)]
pub struct Registry {
    checkers: HashMap<TaskType, Arc<dyn Checker>>,
}

impl Registry {
    pub fn from_params(params: &Params, agent_id: &str) -> Result<Self> {
        let meta = Metadata {
            location: params.location.clone().unwrap_or_else(|| agent_id.to_string()),
            country: params.country.clone(),
        };
        let disabled: Vec<TaskType> = params
            .disabled_checkers
            .iter()
            .map(|name| TaskType::from(name.trim().to_lowercase()))
            .collect();
        for unknown in disabled.iter().filter(|it| matches!(it, TaskType::Unknown(_))) {
            warn!("Ignoring unknown checker `{}` in disabled list", unknown);
        }
        let executor: Arc<dyn ProbeExecutor> = Arc::new(SystemExecutor::new(params.ping_bin_path.clone()));

        let all: Vec<Arc<dyn Checker>> = vec![
            Arc::new(http::HttpChecker::new(
                meta.clone(),
                Duration::from_secs(params.http_timeout_secs),
            )?),
            Arc::new(tcp::TcpChecker::new(
                meta.clone(),
                Duration::from_secs(params.tcp_timeout_secs),
            )),
            Arc::new(ping::PingChecker::new(
                meta.clone(),
                executor.clone(),
                Duration::from_secs(params.ping_timeout_secs),
                params.ping_count,
            )),
            Arc::new(traceroute::TracerouteChecker::new(
                executor,
                params.traceroute_max_hops,
                Duration::from_secs(params.traceroute_hop_timeout_secs),
            )),
            Arc::new(dns::DnsChecker::new(
                meta,
                Duration::from_secs(params.dns_timeout_secs),
            )),
        ];

        let mut registry = Registry::default();
        for checker in all {
            if disabled.contains(&checker.task_type()) {
                info!("Checker {} is disabled by configuration", checker.task_type());
                continue;
            }
            registry.register(checker);
        }
        Ok(registry)
    }

    pub fn register(&mut self, checker: Arc<dyn Checker>) {
        debug!("Registering checker for {}", checker.task_type());
        self.checkers.insert(checker.task_type(), checker);
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn Checker>> {
        self.checkers.get(task_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }
}

/// Runs `work` unless the stop token fires first.
pub(crate) async fn unless_stopped<T>(
    stop_rx: &CancellationToken,
    work: impl Future<Output = T>,
) -> Option<T> {
    select! {
        biased;
        _ = stop_rx.cancelled() => None,
        res = work => Some(res),
    }
}

pub(crate) const CANCELLED: &str = "check cancelled";
