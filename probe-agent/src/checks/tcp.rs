use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::trace;
use queue_models::check_result::{CheckResult, Payload, TcpOutcome, TcpReport};
use queue_models::task::{Parameters, TaskType};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::params::{format_seconds, string_param, timeout_param};
use super::target::socket_target;
use super::{unless_stopped, Checker, Metadata, CANCELLED};

/// Plain TCP handshake against `host:port`.
pub struct TcpChecker {
    meta: Metadata,
    timeout: Duration,
}

impl TcpChecker {
    pub fn new(meta: Metadata, timeout: Duration) -> Self {
        Self { meta, timeout }
    }

    fn report(&self, params: &Parameters, elapsed: Duration, status: TcpOutcome, ip: String) -> Payload {
        Payload::Tcp(vec![TcpReport {
            location: self.meta.location_for(params),
            country: self.meta.country_for(params),
            connect_time: format_seconds(elapsed),
            status,
            ip,
        }])
    }
}

#[async_trait]
impl Checker for TcpChecker {
    fn task_type(&self) -> TaskType {
        TaskType::Tcp
    }

    async fn check(
        &self,
        target: &str,
        params: &Parameters,
        stop_rx: &CancellationToken,
    ) -> Result<CheckResult> {
        let default_port = string_param(params, "port", "80");
        let (host, port) = match socket_target(target, &default_port) {
            Ok(it) => it,
            Err(e) => {
                let payload = self.report(params, Duration::ZERO, TcpOutcome::Failed, target.trim().to_string());
                return Ok(CheckResult::failed(e.to_string(), Some(payload)));
            }
        };
        let connect_timeout = timeout_param(params, self.timeout);

        let started = Instant::now();
        let attempt = unless_stopped(
            stop_rx,
            timeout(connect_timeout, TcpStream::connect((host.as_str(), port))),
        )
        .await;
        let elapsed = started.elapsed();
        trace!("TCP connect to {}:{} ended after {:?}: {:?}", host, port, elapsed, attempt);

        Ok(match attempt {
            None => CheckResult::failed(
                CANCELLED,
                Some(self.report(params, elapsed, TcpOutcome::Failed, host)),
            ),
            Some(Err(_)) => CheckResult::timed_out(
                format!("connect to {}:{} timed out after {:?}", host, port, connect_timeout),
                Some(self.report(params, elapsed, TcpOutcome::Failed, host)),
            ),
            Some(Ok(Err(e))) => CheckResult::failed(
                format!("connect to {}:{} failed: {}", host, port, e),
                Some(self.report(params, elapsed, TcpOutcome::Failed, host)),
            ),
            Some(Ok(Ok(stream))) => {
                let ip = stream
                    .peer_addr()
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or(host);
                CheckResult::success(self.report(params, elapsed, TcpOutcome::Connected, ip))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;
    use queue_models::check_result::CheckStatus;
    use serde_json::json;
    use tokio::net::TcpListener;

    use crate::test_utils::meta;

    use super::*;

    #[tokio::test]
    async fn closed_port_fails_fast() {
        // given
        let checker = TcpChecker::new(meta(), Duration::from_secs(5));
        let mut params = Parameters::new();
        params.insert("timeout".to_string(), json!(2));

        // when
        let started = Instant::now();
        let result = checker
            .check("127.0.0.1:1", &params, &CancellationToken::new())
            .await
            .unwrap();

        // then
        assert_that!(started.elapsed() <= Duration::from_millis(2500)).is_true();
        assert_that!(result.status).is_equal_to(CheckStatus::Failed);
        let value = serde_json::to_value(&result).unwrap();
        assert_that!(value["payload"]["tcp"][0]["status"]).is_equal_to(json!("Failed"));
        assert_that!(value["payload"]["tcp"][0]["ip"]).is_equal_to(json!("127.0.0.1"));
    }

    #[tokio::test]
    async fn open_port_connects() {
        // given
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = TcpChecker::new(meta(), Duration::from_secs(5));
        let mut params = Parameters::new();
        params.insert("port".to_string(), json!(port));

        // when
        let result = checker
            .check("127.0.0.1", &params, &CancellationToken::new())
            .await
            .unwrap();

        // then
        assert_that!(result.status).is_equal_to(CheckStatus::Success);
        let Some(Payload::Tcp(reports)) = &result.payload else {
            panic!("expected tcp payload, got {:?}", result.payload);
        };
        assert_that!(reports[0].status).is_equal_to(TcpOutcome::Connected);
        assert_that!(reports[0].ip.as_str()).is_equal_to("127.0.0.1");
        assert_that!(reports[0].connect_time.ends_with(" s")).is_true();
    }

    #[tokio::test]
    async fn invalid_port_is_reported() {
        // given
        let checker = TcpChecker::new(meta(), Duration::from_secs(5));

        // when
        let result = checker
            .check("localhost:ssh", &Parameters::new(), &CancellationToken::new())
            .await
            .unwrap();

        // then
        assert_that!(result.status).is_equal_to(CheckStatus::Failed);
        assert_that!(result.error.as_str()).is_equal_to("invalid port: ssh");
        assert_that!(result.payload.is_some()).is_true();
    }
}
