use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HealthError {
    #[error("agent loop is not running")]
    NotRunning,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub agent_id: String,
    pub is_running: bool,
    /// e.g. `30s`
    pub poll_interval: String,
    pub checker_count: usize,
}

/// Read-only view on a running agent, cheap to clone and hand out.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    agent_id: String,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    checker_count: usize,
}

impl StatusHandle {
    pub(super) fn new(
        agent_id: String,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
        checker_count: usize,
    ) -> Self {
        Self {
            agent_id,
            running,
            poll_interval,
            checker_count,
        }
    }

    pub fn health_check(&self) -> Result<(), HealthError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HealthError::NotRunning)
        }
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.agent_id.clone(),
            is_running: self.running.load(Ordering::SeqCst),
            poll_interval: format!("{:?}", self.poll_interval),
            checker_count: self.checker_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn reflects_running_flag() {
        // given
        let running = Arc::new(AtomicBool::new(false));
        let handle = StatusHandle::new("agent-1".to_string(), running.clone(), Duration::from_secs(30), 5);

        // when
        let before = handle.health_check();
        running.store(true, Ordering::SeqCst);

        // then
        assert_that!(before).is_equal_to(Err(HealthError::NotRunning));
        assert_that!(handle.health_check()).is_equal_to(Ok(()));
        assert_that!(handle.status()).is_equal_to(AgentStatus {
            agent_id: "agent-1".to_string(),
            is_running: true,
            poll_interval: "30s".to_string(),
            checker_count: 5,
        });
    }
}
