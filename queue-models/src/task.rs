use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Open per-checker configuration knobs, straight from the task message.
pub type Parameters = Map<String, Value>;

/// Parameter that carries the effective check timeout down to the checker.
pub const TIMEOUT_PARAM: &str = "timeout";

/// Kind of diagnostic a task asks for. Tags we don't know are kept verbatim in
/// [TaskType::Unknown], so that the failure report can name them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Http,
    Tcp,
    Ping,
    Traceroute,
    Dns,
    Unknown(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Http => "http",
            TaskType::Tcp => "tcp",
            TaskType::Ping => "ping",
            TaskType::Traceroute => "traceroute",
            TaskType::Dns => "dns",
            TaskType::Unknown(other) => other,
        }
    }
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Unknown(String::new())
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "http" => TaskType::Http,
            "tcp" => TaskType::Tcp,
            "ping" => TaskType::Ping,
            "traceroute" => TaskType::Traceroute,
            "dns" => TaskType::Dns,
            _ => TaskType::Unknown(value),
        }
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Required for processing; messages without it are dropped by the consumer.
    #[serde(rename = "task_id", default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub task_type: TaskType,

    #[serde(default)]
    pub target: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub parameters: Parameters,

    /// Seconds. Zero and negative values mean "use the checker default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn timeout_secs(&self) -> Option<u64> {
        self.timeout
            .filter(|secs| *secs > 0)
            .and_then(|secs| u64::try_from(secs).ok())
    }

    /// Parameters as handed to the checker: an explicit `timeout` parameter wins,
    /// otherwise the task-level timeout is passed down.
    pub fn check_parameters(&self) -> Cow<'_, Parameters> {
        match self.timeout_secs() {
            Some(secs) if !self.parameters.contains_key(TIMEOUT_PARAM) => {
                let mut params = self.parameters.clone();
                params.insert(TIMEOUT_PARAM.to_string(), Value::from(secs));
                Cow::Owned(params)
            }
            _ => Cow::Borrowed(&self.parameters),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
