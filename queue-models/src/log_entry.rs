use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::KeyedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// Progress note about a single task, shipped to the logs exchange on a best-effort basis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub task_id: String,
    pub agent_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    fn new(task_id: &str, agent_id: &str, level: LogLevel, message: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            level,
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn info(task_id: &str, agent_id: &str, message: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, LogLevel::Info, message.into())
    }

    pub fn error(task_id: &str, agent_id: &str, message: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, LogLevel::Error, message.into())
    }
}

impl KeyedMessage for LogEntry {
    fn routing_key(&self) -> String {
        format!(
            "{}-{}",
            self.task_id,
            self.timestamp.timestamp_nanos_opt().unwrap_or_default()
        )
    }
}
