use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use queue_models::check_result::{CheckResult, PacketStats, Payload, PingReport, RoundTrip};
use queue_models::task::{Parameters, TaskType};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::params::{positive_param, timeout_param};
use super::probe::{ProbeEnd, ProbeExecutor};
use super::target::host_of;
use super::{Checker, Metadata, CANCELLED};

lazy_static! {
    // iputils: `4 packets transmitted, 4 received, +1 errors, 0% packet loss`
    // busybox: `4 packets transmitted, 4 packets received, 0% packet loss`
    static ref SUMMARY: Regex = Regex::new(
        r"(?m)(\d+) packets transmitted, (\d+) (?:packets )?received,(?: \+\d+ errors,)?(?: \+\d+ duplicates,)? ([0-9.]+)% packet loss"
    ).unwrap();
    // iputils: `rtt min/avg/max/mdev = 0.041/0.050/0.062/0.008 ms`
    // busybox: `round-trip min/avg/max = 0.058/0.070/0.084 ms`
    static ref RTT: Regex = Regex::new(
        r"(?m)(?:rtt|round-trip) [^=]*= ([0-9.]+)/([0-9.]+)/([0-9.]+)"
    ).unwrap();
    static ref HEADER_IP: Regex = Regex::new(r"(?m)^PING [^(]*\(([0-9a-fA-F:.]+)\)").unwrap();
    static ref BYTES_FROM: Regex = Regex::new(
        r"(?m)^\d+ bytes from (\S+)(?: \(([0-9a-fA-F:.]+)\))?"
    ).unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingSummary {
    pub transmitted: u32,
    pub received: u32,
    pub loss: String,
    pub round_trip: RoundTrip,
    pub ip: String,
}

/// Extracts what we report from `ping` output. Missing pieces are filled in as if nothing came
/// back, i.e. `count` sent, none received.
pub fn parse_output(output: &str, count: u32, fallback_ip: &str) -> PingSummary {
    let (transmitted, received, loss) = match SUMMARY.captures(output) {
        Some(caps) => (
            caps[1].parse().unwrap_or(count),
            caps[2].parse().unwrap_or(0),
            caps[3].parse::<f64>().unwrap_or(100.0),
        ),
        None => (count, 0, 100.0),
    };
    let round_trip = match RTT.captures(output) {
        Some(caps) => RoundTrip {
            min: format!("{} ms", &caps[1]),
            avg: format!("{} ms", &caps[2]),
            max: format!("{} ms", &caps[3]),
        },
        None => RoundTrip {
            min: "0.0 ms".to_string(),
            avg: "0.0 ms".to_string(),
            max: "0.0 ms".to_string(),
        },
    };
    PingSummary {
        transmitted,
        received,
        loss: format!("{:.0}%", loss),
        round_trip,
        ip: reply_ip(output).unwrap_or_else(|| fallback_ip.to_string()),
    }
}

fn reply_ip(output: &str) -> Option<String> {
    if let Some(caps) = HEADER_IP.captures(output) {
        return Some(caps[1].to_string());
    }
    bytes_from_ip(output)
}

pub(super) fn bytes_from_ip(output: &str) -> Option<String> {
    let caps = BYTES_FROM.captures(output)?;
    match caps.get(2) {
        Some(ip) => Some(ip.as_str().to_string()),
        None => Some(clean_addr(&caps[1])),
    }
}

/// `192.0.2.1:` or `<192.0.2.1>` as printed by the various ping flavours
pub(super) fn clean_addr(raw: &str) -> String {
    raw.trim_end_matches(':')
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

/// Deadline in whole seconds as ping's `-w`/`-W` expect it, at least one.
pub(super) fn whole_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

pub struct PingChecker {
    meta: Metadata,
    executor: Arc<dyn ProbeExecutor>,
    timeout: Duration,
    count: u32,
}

impl PingChecker {
    pub fn new(meta: Metadata, executor: Arc<dyn ProbeExecutor>, timeout: Duration, count: u32) -> Self {
        Self {
            meta,
            executor,
            timeout,
            count: count.max(1),
        }
    }

    fn report(&self, params: &Parameters, summary: PingSummary) -> Payload {
        Payload::Ping(vec![PingReport {
            location: self.meta.location_for(params),
            country: self.meta.country_for(params),
            ip: summary.ip,
            packets: PacketStats {
                transmitted: summary.transmitted,
                received: summary.received,
                loss: summary.loss,
            },
            round_trip: summary.round_trip,
        }])
    }
}

#[async_trait]
impl Checker for PingChecker {
    fn task_type(&self) -> TaskType {
        TaskType::Ping
    }

    async fn check(
        &self,
        target: &str,
        params: &Parameters,
        stop_rx: &CancellationToken,
    ) -> Result<CheckResult> {
        let count = positive_param(params, "count", self.count);
        let host = match host_of(target) {
            Ok(host) => host,
            Err(e) => {
                let summary = parse_output("", count, target.trim());
                return Ok(CheckResult::failed(e.to_string(), Some(self.report(params, summary))));
            }
        };
        let timeout = timeout_param(params, self.timeout);

        let args = vec![
            "-n".to_string(),
            "-c".to_string(),
            count.to_string(),
            "-w".to_string(),
            whole_secs(timeout).to_string(),
            host.clone(),
        ];
        let probe = self
            .executor
            .run(&args, timeout + Duration::from_secs(1), stop_rx)
            .await?;

        let summary = parse_output(&probe.output, count, &host);
        let received = summary.received;
        let payload = self.report(params, summary);
        Ok(match probe.end {
            ProbeEnd::Cancelled => CheckResult::failed(CANCELLED, Some(payload)),
            ProbeEnd::TimedOut => CheckResult::timed_out(
                format!("ping did not finish within {:?}", timeout),
                Some(payload),
            ),
            ProbeEnd::Exited { success: false, code } if received > 0 => CheckResult::failed(
                format!("ping exited with code {}", code.unwrap_or(-1)),
                Some(payload),
            ),
            _ if received == 0 => CheckResult::failed("no packets received", Some(payload)),
            _ => CheckResult::success(payload),
        })
    }
}
