use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use lazy_static::lazy_static;
use log::trace;
use queue_models::check_result::{CheckResult, Payload, TracerouteHop};
use queue_models::task::{Parameters, TaskType};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::params::{format_millis, positive_param, timeout_param};
use super::ping::{bytes_from_ip, clean_addr, whole_secs};
use super::probe::{ProbeEnd, ProbeExecutor};
use super::target::host_of;
use super::{Checker, CANCELLED};

/// IP TTL is a single byte.
const MAX_TTL: u32 = 255;

lazy_static! {
    // `From 192.0.2.1 icmp_seq=1 Time to live exceeded`
    static ref FROM: Regex = Regex::new(r"(?m)^From (\S+)").unwrap();
    static ref TIME: Regex = Regex::new(r"time[=<]([0-9.]+) ?ms").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopReply {
    /// The target itself answered, we're done.
    Destination { ip: String, time: Option<String> },
    /// A router on the way reported the expired TTL.
    Router { ip: String, time: Option<String> },
    NoReply,
}

/// Interprets the output of one `ping -c 1 -t <ttl>` call.
pub fn parse_hop(output: &str) -> HopReply {
    let time = TIME
        .captures(output)
        .map(|caps| format!("{} ms", &caps[1]));
    if let Some(ip) = bytes_from_ip(output) {
        return HopReply::Destination { ip, time };
    }
    match FROM.captures(output) {
        Some(caps) => HopReply::Router {
            ip: clean_addr(&caps[1]),
            time,
        },
        None => HopReply::NoReply,
    }
}

/// Hop-by-hop path discovery built from single pings with increasing TTL.
pub struct TracerouteChecker {
    executor: Arc<dyn ProbeExecutor>,
    max_hops: u32,
    hop_timeout: Duration,
}

impl TracerouteChecker {
    pub fn new(executor: Arc<dyn ProbeExecutor>, max_hops: u32, hop_timeout: Duration) -> Self {
        Self {
            executor,
            max_hops: max_hops.clamp(1, MAX_TTL),
            hop_timeout,
        }
    }

    fn hop_args(host: &str, ttl: u32, hop_timeout: Duration) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-c".to_string(),
            "1".to_string(),
            "-t".to_string(),
            ttl.to_string(),
            "-W".to_string(),
            whole_secs(hop_timeout).to_string(),
            host.to_string(),
        ]
    }
}

#[async_trait]
impl Checker for TracerouteChecker {
    fn task_type(&self) -> TaskType {
        TaskType::Traceroute
    }

    async fn check(
        &self,
        target: &str,
        params: &Parameters,
        stop_rx: &CancellationToken,
    ) -> Result<CheckResult> {
        let host = match host_of(target) {
            Ok(host) => host,
            Err(e) => {
                return Ok(CheckResult::failed(e.to_string(), Some(Payload::Traceroute(vec![]))));
            }
        };
        let max_hops = positive_param(params, "max_hops", self.max_hops).min(MAX_TTL);
        let hop_timeout = timeout_param(params, self.hop_timeout);

        let mut hops = vec![];
        let mut silent_hops = vec![];
        for ttl in 1..=max_hops {
            if stop_rx.is_cancelled() {
                return Ok(CheckResult::failed(CANCELLED, Some(Payload::Traceroute(hops))));
            }
            let probe = self
                .executor
                .run(
                    &Self::hop_args(&host, ttl, hop_timeout),
                    hop_timeout + Duration::from_secs(1),
                    stop_rx,
                )
                .await?;
            if probe.end == ProbeEnd::Cancelled {
                return Ok(CheckResult::failed(CANCELLED, Some(Payload::Traceroute(hops))));
            }

            let reply = parse_hop(&probe.output);
            trace!("Hop {} towards {}: {:?}", ttl, host, reply);
            let measured = || format_millis(probe.elapsed);
            match reply {
                HopReply::Destination { ip, time } => {
                    hops.push(TracerouteHop {
                        hop: ttl,
                        ip,
                        time: time.unwrap_or_else(measured),
                    });
                    break;
                }
                HopReply::Router { ip, time } => hops.push(TracerouteHop {
                    hop: ttl,
                    ip,
                    time: time.unwrap_or_else(measured),
                }),
                HopReply::NoReply => {
                    hops.push(TracerouteHop::no_reply(ttl));
                    silent_hops.push(ttl);
                }
            }
        }

        let payload = Payload::Traceroute(hops);
        if silent_hops.is_empty() {
            Ok(CheckResult::success(payload))
        } else {
            let error = format!("no reply from hops {}", silent_hops.iter().join(", "));
            Ok(CheckResult::failed(error, Some(payload)))
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;
    use queue_models::check_result::CheckStatus;
    use serde_json::json;

    use crate::test_utils::FakeExecutor;

    use super::*;

    const TTL_EXCEEDED: &str = "PING 198.51.100.7 (198.51.100.7) 56(84) bytes of data.
From 10.0.0.1 icmp_seq=1 Time to live exceeded

--- 198.51.100.7 ping statistics ---
1 packets transmitted, 0 received, +1 errors, 100% packet loss, time 0ms
";

    const SILENT: &str = "PING 198.51.100.7 (198.51.100.7) 56(84) bytes of data.

--- 198.51.100.7 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";

    const REACHED: &str = "PING 198.51.100.7 (198.51.100.7) 56(84) bytes of data.
64 bytes from 198.51.100.7: icmp_seq=1 ttl=61 time=4.21 ms

--- 198.51.100.7 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
";

    #[test]
    fn parses_hop_replies() {
        assert_that!(parse_hop(TTL_EXCEEDED)).is_equal_to(HopReply::Router {
            ip: "10.0.0.1".to_string(),
            time: None,
        });
        assert_that!(parse_hop(REACHED)).is_equal_to(HopReply::Destination {
            ip: "198.51.100.7".to_string(),
            time: Some("4.21 ms".to_string()),
        });
        assert_that!(parse_hop(SILENT)).is_equal_to(HopReply::NoReply);
    }

    #[tokio::test]
    async fn unreachable_tail_yields_sentinels_for_every_hop() {
        // given
        let executor = Arc::new(FakeExecutor::exiting(vec![
            (TTL_EXCEEDED, 1),
            (TTL_EXCEEDED, 1),
            (TTL_EXCEEDED, 1),
            (SILENT, 1),
            (SILENT, 1),
        ]));
        let checker = TracerouteChecker::new(executor.clone(), 30, Duration::from_secs(3));
        let mut params = Parameters::new();
        params.insert("max_hops".to_string(), json!(5));

        // when
        let result = checker
            .check("198.51.100.7", &params, &CancellationToken::new())
            .await
            .unwrap();

        // then
        let Some(Payload::Traceroute(hops)) = &result.payload else {
            panic!("expected traceroute payload, got {:?}", result.payload);
        };
        assert_that!(hops.len()).is_equal_to(5);
        assert_that!(hops.iter().map(|it| it.hop).collect::<Vec<_>>()).is_equal_to(vec![1, 2, 3, 4, 5]);
        assert_that!(hops[0].ip.as_str()).is_equal_to("10.0.0.1");
        assert_that!(hops[0].time.ends_with(" ms")).is_true();
        assert_that!(hops[3].is_no_reply()).is_true();
        assert_that!(hops[4].time.as_str()).is_equal_to("timeout");
        assert_that!(result.status).is_equal_to(CheckStatus::Failed);
        assert_that!(result.error.as_str()).is_equal_to("no reply from hops 4, 5");
        assert_that!(executor.calls()[2].join(" ")).is_equal_to("-n -c 1 -t 3 -W 3 198.51.100.7".to_string());
    }

    #[tokio::test]
    async fn stops_once_destination_answers() {
        // given
        let executor = Arc::new(FakeExecutor::exiting(vec![(TTL_EXCEEDED, 1), (REACHED, 0)]));
        let checker = TracerouteChecker::new(executor.clone(), 30, Duration::from_secs(3));

        // when
        let result = checker
            .check("198.51.100.7", &Parameters::new(), &CancellationToken::new())
            .await
            .unwrap();

        // then
        assert_that!(result.status).is_equal_to(CheckStatus::Success);
        assert_that!(executor.calls().len()).is_equal_to(2);
        let value = serde_json::to_value(&result).unwrap();
        assert_that!(value["payload"]["traceroute"][1]).is_equal_to(json!({
            "hop": 2, "ip": "198.51.100.7", "time": "4.21 ms"
        }));
    }

    #[tokio::test]
    async fn max_hops_is_capped_at_largest_ttl() {
        // given
        let executor = Arc::new(FakeExecutor::exiting(vec![]));
        let checker = TracerouteChecker::new(executor.clone(), 30, Duration::from_secs(3));
        let mut params = Parameters::new();
        params.insert("max_hops".to_string(), json!(4_000_000_000u64));

        // when
        let result = checker
            .check("198.51.100.7", &params, &CancellationToken::new())
            .await
            .unwrap();

        // then
        let calls = executor.calls();
        assert_that!(calls.len()).is_equal_to(255);
        assert_that!(calls[254].join(" ")).is_equal_to("-n -c 1 -t 255 -W 3 198.51.100.7".to_string());
        let Some(Payload::Traceroute(hops)) = &result.payload else {
            panic!("expected traceroute payload, got {:?}", result.payload);
        };
        assert_that!(hops.len()).is_equal_to(255);
    }

    #[test]
    fn configured_max_hops_is_capped_too() {
        let checker = TracerouteChecker::new(Arc::new(FakeExecutor::exiting(vec![])), 300, Duration::from_secs(3));
        assert_that!(checker.max_hops).is_equal_to(255);
    }

    #[tokio::test]
    async fn cancelled_before_start_probes_nothing() {
        // given
        let executor = Arc::new(FakeExecutor::exiting(vec![]));
        let checker = TracerouteChecker::new(executor.clone(), 30, Duration::from_secs(3));
        let stop_rx = CancellationToken::new();
        stop_rx.cancel();

        // when
        let result = checker.check("198.51.100.7", &Parameters::new(), &stop_rx).await.unwrap();

        // then
        assert_that!(result.status).is_equal_to(CheckStatus::Failed);
        assert_that!(executor.calls().is_empty()).is_true();
    }
}
