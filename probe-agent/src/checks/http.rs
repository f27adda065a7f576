use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, trace};
use queue_models::check_result::{CheckResult, HttpOutcome, HttpReport, Payload};
use queue_models::task::{Parameters, TaskType};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Response};
use serde_json::Value;
use tokio::net::lookup_host;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::params::{format_seconds, string_param, timeout_param};
use super::target::http_url;
use super::{unless_stopped, Checker, Metadata, CANCELLED};

const MAX_REDIRECTS: usize = 10;

/// One request against a URL; status codes from 400 up count as failure.
pub struct HttpChecker {
    meta: Metadata,
    timeout: Duration,
    client: Client,
}

impl HttpChecker {
    pub fn new(meta: Metadata, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            meta,
            timeout,
            client,
        })
    }

    fn report(&self, params: &Parameters, elapsed: Duration, status: u16, ip: String) -> Payload {
        let result = if status == 0 || status >= 400 {
            HttpOutcome::Failed
        } else {
            HttpOutcome::Ok
        };
        Payload::Http(vec![HttpReport {
            location: self.meta.location_for(params),
            country: self.meta.country_for(params),
            time: format_seconds(elapsed),
            status,
            ip,
            result,
        }])
    }

    fn failure(&self, params: &Parameters, elapsed: Duration, host: String, error: String) -> CheckResult {
        CheckResult::failed(error, Some(self.report(params, elapsed, 0, host)))
    }

    fn build_request(&self, url: &Url, params: &Parameters, timeout: Duration) -> Result<reqwest::Request, String> {
        let method_name = string_param(params, "method", "GET").to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| format!("invalid method: {}", method_name))?;
        let mut builder = self
            .client
            .request(method, url.clone())
            .headers(headers_from(params)?)
            .timeout(timeout);
        let body = string_param(params, "body", "");
        if !body.is_empty() {
            builder = builder.body(body);
        }
        builder.build().map_err(error_chain)
    }
}

/// `headers` parameter as a header map, non-string values are rendered as JSON.
fn headers_from(params: &Parameters) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    let Some(Value::Object(raw)) = params.get("headers") else {
        return Ok(headers);
    };
    for (name, value) in raw {
        let rendered = match value {
            Value::String(it) => it.clone(),
            other => other.to_string(),
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("invalid header name: {}", name))?;
        let value =
            HeaderValue::from_str(&rendered).map_err(|_| format!("invalid value for header {}", name))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn host_for_payload(url: &Url) -> String {
    url.host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
        .unwrap_or_else(|| url.to_string())
}

/// Address of the server that answered; falls back to a fresh lookup and then to the host.
async fn remote_ip(response: &Response, url: &Url) -> String {
    if let Some(addr) = response.remote_addr() {
        return addr.ip().to_string();
    }
    let host = host_for_payload(url);
    let port = url.port_or_known_default().unwrap_or(80);
    match lookup_host((host.as_str(), port)).await {
        Ok(mut addrs) => addrs
            .next()
            .map(|addr: SocketAddr| addr.ip().to_string())
            .unwrap_or(host),
        Err(e) => {
            debug!("Fallback lookup of {} failed: {}", host, e);
            host
        }
    }
}

/// Reads the body to its end, so the connection is released cleanly.
async fn drain(mut response: Response) {
    loop {
        match response.chunk().await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                trace!("Body of {} not fully read: {}", response.url(), e);
                break;
            }
        }
    }
}

/// reqwest keeps the interesting part (DNS, connection refused...) in the source chain.
fn error_chain(e: reqwest::Error) -> String {
    format!("{:#}", anyhow::Error::from(e))
}

#[async_trait]
impl Checker for HttpChecker {
    fn task_type(&self) -> TaskType {
        TaskType::Http
    }

    async fn check(
        &self,
        target: &str,
        params: &Parameters,
        stop_rx: &CancellationToken,
    ) -> Result<CheckResult> {
        let url = match http_url(target) {
            Ok(url) => url,
            Err(e) => return Ok(self.failure(params, Duration::ZERO, target.trim().to_string(), e.to_string())),
        };
        let host = host_for_payload(&url);
        let timeout = timeout_param(params, self.timeout);
        let request = match self.build_request(&url, params, timeout) {
            Ok(request) => request,
            Err(e) => return Ok(self.failure(params, Duration::ZERO, host, e)),
        };

        let started = Instant::now();
        let sent = unless_stopped(stop_rx, self.client.execute(request)).await;
        let elapsed = started.elapsed();
        let response = match sent {
            None => return Ok(self.failure(params, elapsed, host, CANCELLED.to_string())),
            Some(Err(e)) if e.is_timeout() => {
                let payload = self.report(params, elapsed, 0, host);
                return Ok(CheckResult::timed_out(error_chain(e), Some(payload)));
            }
            Some(Err(e)) => return Ok(self.failure(params, elapsed, host, error_chain(e))),
            Some(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let ip = remote_ip(&response, &url).await;
        if unless_stopped(stop_rx, drain(response)).await.is_none() {
            return Ok(self.failure(params, elapsed, host, CANCELLED.to_string()));
        }
        let payload = self.report(params, elapsed, status, ip);
        Ok(if status >= 400 {
            CheckResult::failed(format!("unexpected status code {}", status), Some(payload))
        } else {
            CheckResult::success(payload)
        })
    }
}
