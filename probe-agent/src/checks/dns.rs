use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant as StdInstant};

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use itertools::Itertools;
use log::{debug, warn};
use queue_models::check_result::{CheckResult, DnsLocation, DnsReport, Payload};
use queue_models::task::{Parameters, TaskType};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::params::{format_ttl, string_param, timeout_param};
use super::target::host_of;
use super::{unless_stopped, Checker, Metadata, CANCELLED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    A,
    Aaaa,
    Mx,
    Ns,
    Txt,
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_uppercase().as_str() {
            "A" => Ok(RecordKind::A),
            "AAAA" => Ok(RecordKind::Aaaa),
            "MX" => Ok(RecordKind::Mx),
            "NS" => Ok(RecordKind::Ns),
            "TXT" => Ok(RecordKind::Txt),
            other => Err(format!("unsupported record type: {}", other)),
        }
    }
}

#[derive(Debug, Default)]
struct Answer {
    records: Vec<String>,
    valid_until: Option<StdInstant>,
}

/// Addresses of the requested family. If there are none, all addresses are kept so that the
/// report still says what the name resolves to.
pub fn filter_family(addrs: &[IpAddr], want_v6: bool) -> Vec<String> {
    let matching: Vec<String> = addrs
        .iter()
        .filter(|ip| ip.is_ipv6() == want_v6)
        .map(IpAddr::to_string)
        .collect();
    if matching.is_empty() {
        addrs.iter().map(IpAddr::to_string).collect()
    } else {
        matching
    }
}

/// `<preference> <exchange>`, lowest preference first.
pub fn format_mx(mut entries: Vec<(u16, String)>) -> Vec<String> {
    entries.sort_by_key(|(preference, _)| *preference);
    entries
        .into_iter()
        .map(|(preference, exchange)| format!("{} {}", preference, trim_root(&exchange)))
        .collect()
}

pub fn trim_root(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

fn remaining(valid_until: Option<StdInstant>) -> Duration {
    valid_until
        .map(|until| until.saturating_duration_since(StdInstant::now()))
        .unwrap_or_default()
}

/// Name resolution through the system's configured nameservers.
pub struct DnsChecker {
    meta: Metadata,
    timeout: Duration,
    resolver: TokioAsyncResolver,
}

impl DnsChecker {
    pub fn new(meta: Metadata, timeout: Duration) -> Self {
        let (config, mut opts) = read_system_conf().unwrap_or_else(|e| {
            warn!("Unable to read system resolver config, using public defaults: {}", e);
            (ResolverConfig::default(), ResolverOpts::default())
        });
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        opts.timeout = timeout;
        Self {
            meta,
            timeout,
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    fn report(&self, params: &Parameters, records: &[String], ttl: String) -> Payload {
        Payload::Dns(DnsReport {
            locations: vec![DnsLocation {
                location: self.meta.location_for(params),
                country: self.meta.country_for(params),
                records: records.join(", "),
                ttl,
            }],
        })
    }

    async fn lookup(&self, host: &str, kind: RecordKind) -> Result<Answer, ResolveError> {
        let answer = match kind {
            RecordKind::A | RecordKind::Aaaa => {
                let found = self.resolver.lookup_ip(host).await?;
                let addrs: Vec<IpAddr> = found.iter().collect();
                Answer {
                    records: filter_family(&addrs, kind == RecordKind::Aaaa),
                    valid_until: Some(found.as_lookup().valid_until()),
                }
            }
            RecordKind::Mx => {
                let found = self.resolver.mx_lookup(host).await?;
                let entries = found
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_string()))
                    .collect();
                Answer {
                    records: format_mx(entries),
                    valid_until: Some(found.as_lookup().valid_until()),
                }
            }
            RecordKind::Ns => {
                let found = self.resolver.ns_lookup(host).await?;
                Answer {
                    records: found
                        .iter()
                        .map(|ns| trim_root(&ns.to_string()).to_string())
                        .collect(),
                    valid_until: Some(found.as_lookup().valid_until()),
                }
            }
            RecordKind::Txt => {
                let found = self.resolver.txt_lookup(host).await?;
                Answer {
                    records: found
                        .iter()
                        .map(|txt| {
                            txt.txt_data()
                                .iter()
                                .map(|part| String::from_utf8_lossy(part))
                                .join("")
                        })
                        .collect(),
                    valid_until: Some(found.as_lookup().valid_until()),
                }
            }
        };
        Ok(answer)
    }
}

#[async_trait]
impl Checker for DnsChecker {
    fn task_type(&self) -> TaskType {
        TaskType::Dns
    }

    async fn check(
        &self,
        target: &str,
        params: &Parameters,
        stop_rx: &CancellationToken,
    ) -> Result<CheckResult> {
        let na = || "N/A".to_string();
        let host = match host_of(target) {
            Ok(host) => host,
            Err(e) => return Ok(CheckResult::failed(e.to_string(), Some(self.report(params, &[], na())))),
        };
        let kind = match string_param(params, "record_type", "A").parse::<RecordKind>() {
            Ok(kind) => kind,
            Err(e) => return Ok(CheckResult::failed(e, Some(self.report(params, &[], na())))),
        };
        let lookup_timeout = timeout_param(params, self.timeout);

        let outcome = unless_stopped(stop_rx, timeout(lookup_timeout, self.lookup(&host, kind))).await;
        debug!("{:?} lookup of {}: {:?}", kind, host, outcome);
        Ok(match outcome {
            None => CheckResult::failed(CANCELLED, Some(self.report(params, &[], na()))),
            Some(Err(_)) => CheckResult::timed_out(
                format!("{:?} lookup of {} timed out after {:?}", kind, host, lookup_timeout),
                Some(self.report(params, &[], na())),
            ),
            Some(Ok(Err(e))) => CheckResult::failed(e.to_string(), Some(self.report(params, &[], na()))),
            Some(Ok(Ok(answer))) => {
                let ttl = format_ttl(remaining(answer.valid_until));
                CheckResult::success(self.report(params, &answer.records, ttl))
            }
        })
    }
}
