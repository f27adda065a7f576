use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::KeyedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Failed,
    /// The check's own deadline elapsed before the target answered.
    Timeout,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Success => "success",
            CheckStatus::Failed => "failed",
            CheckStatus::Timeout => "timeout",
        })
    }
}

/// Protocol-specific section of a result, serialised as `{"<protocol>": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Http(Vec<HttpReport>),
    Tcp(Vec<TcpReport>),
    Ping(Vec<PingReport>),
    Traceroute(Vec<TracerouteHop>),
    Dns(DnsReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpOutcome {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReport {
    pub location: String,
    pub country: String,
    /// Total request time, e.g. `0.231 s`.
    pub time: String,
    /// Zero if no response was received at all.
    pub status: u16,
    pub ip: String,
    pub result: HttpOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcpOutcome {
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpReport {
    pub location: String,
    pub country: String,
    #[serde(rename = "connectTime")]
    pub connect_time: String,
    pub status: TcpOutcome,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketStats {
    pub transmitted: u32,
    pub received: u32,
    /// Percentage, e.g. `25%`.
    pub loss: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTrip {
    pub min: String,
    pub avg: String,
    pub max: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReport {
    pub location: String,
    pub country: String,
    pub ip: String,
    pub packets: PacketStats,
    #[serde(rename = "roundTrip")]
    pub round_trip: RoundTrip,
}

pub const NO_REPLY_IP: &str = "*";
pub const NO_REPLY_TIME: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerouteHop {
    pub hop: u32,
    pub ip: String,
    pub time: String,
}

impl TracerouteHop {
    pub fn no_reply(hop: u32) -> Self {
        Self {
            hop,
            ip: NO_REPLY_IP.to_string(),
            time: NO_REPLY_TIME.to_string(),
        }
    }

    pub fn is_no_reply(&self) -> bool {
        self.ip == NO_REPLY_IP
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsReport {
    pub locations: Vec<DnsLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsLocation {
    pub location: String,
    pub country: String,
    /// Comma-joined record values.
    pub records: String,
    pub ttl: String,
}

/// Outcome of one task, produced exactly once per processed task. Checkers fill in status,
/// error and payload; the agent stamps the rest via [CheckResult::stamp].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub task_id: String,
    pub agent_id: String,
    pub status: CheckStatus,
    /// Milliseconds of wall-clock time spent on the check.
    pub duration: u64,
    #[serde(default)]
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<Payload>,
}

impl CheckResult {
    fn new(status: CheckStatus, error: String, payload: Option<Payload>) -> Self {
        Self {
            task_id: String::new(),
            agent_id: String::new(),
            status,
            duration: 0,
            error,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn success(payload: Payload) -> Self {
        Self::new(CheckStatus::Success, String::new(), Some(payload))
    }

    pub fn failed(error: impl Into<String>, payload: Option<Payload>) -> Self {
        Self::new(CheckStatus::Failed, error.into(), payload)
    }

    pub fn timed_out(error: impl Into<String>, payload: Option<Payload>) -> Self {
        Self::new(CheckStatus::Timeout, error.into(), payload)
    }

    pub fn stamp(mut self, task_id: &str, agent_id: &str, duration_ms: u64) -> Self {
        self.task_id = task_id.to_string();
        self.agent_id = agent_id.to_string();
        self.duration = duration_ms;
        self.timestamp = Utc::now();
        self
    }
}

impl KeyedMessage for CheckResult {
    fn routing_key(&self) -> String {
        self.task_id.clone()
    }
}
