use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use queue_models::check_result::{CheckResult, Payload};
use queue_models::task::{Parameters, Task, TaskType};
use serde_json::Value;
use tokio::select;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::checks::{Checker, Metadata, ProbeEnd, ProbeExecutor, ProbeOutput};
use crate::repository::{FetchError, RecordPublisher, TaskConsumer};

pub fn task(id: &str, task_type: &str) -> Task {
    Task {
        id: id.to_string(),
        task_type: TaskType::from(task_type.to_string()),
        target: "127.0.0.1".to_string(),
        parameters: Parameters::new(),
        timeout: None,
        scheduled_at: None,
        created_at: None,
    }
}

pub fn meta() -> Metadata {
    Metadata {
        location: "fra-1".to_string(),
        country: "DE".to_string(),
    }
}

/// Hands out the given tasks with delivery tags 1, 2, ... and then waits for the deadline.
#[derive(Default)]
pub struct FakeConsumer {
    queue: Mutex<VecDeque<(Task, u64)>>,
    closed: AtomicBool,
    committed: Mutex<Vec<u64>>,
    released: Mutex<Vec<u64>>,
    /// Number of upcoming commits that fail.
    pub failing_commits: AtomicU32,
    pub commit_calls: AtomicU32,
}

impl FakeConsumer {
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let queue = tasks.into_iter().zip(1u64..).collect();
        Self {
            queue: Mutex::new(queue),
            ..Default::default()
        }
    }

    /// Once drained, behaves like a consumer whose channel went away.
    pub fn close_after_drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn committed(&self) -> Vec<u64> {
        self.committed.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<u64> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskConsumer for FakeConsumer {
    async fn fetch(&self, stop_rx: &CancellationToken, deadline: Instant) -> Result<(Task, u64), FetchError> {
        if stop_rx.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return Ok(next);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::ChannelClosed("fake".to_string()));
        }
        select! {
            biased;
            _ = stop_rx.cancelled() => Err(FetchError::Cancelled),
            _ = sleep_until(deadline) => Err(FetchError::DeadlineExceeded),
        }
    }

    async fn commit(&self, delivery_tag: u64) -> Result<()> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_commits.store(failing - 1, Ordering::SeqCst);
            bail!("channel hiccup while acking {}", delivery_tag);
        }
        self.committed.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn release(&self, delivery_tag: u64) -> Result<()> {
        self.released.lock().unwrap().push(delivery_tag);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePublisher {
    fail: bool,
    published: Mutex<Vec<(String, Value)>>,
}

impl FakePublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordPublisher for FakePublisher {
    async fn publish(&self, routing_key: &str, record: &Value) -> Result<()> {
        if self.fail {
            bail!("exchange unavailable");
        }
        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), record.clone()));
        Ok(())
    }
}

/// Plays back canned probe output instead of running `ping`.
/// Once the script is exhausted, every run ends with exit code 1 and no output.
pub struct FakeExecutor {
    script: Mutex<VecDeque<(String, ProbeEnd)>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeExecutor {
    fn scripted(script: Vec<(&str, ProbeEnd)>) -> Self {
        Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|(output, end)| (output.to_string(), end))
                    .collect(),
            ),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn exiting(script: Vec<(&str, i32)>) -> Self {
        Self::scripted(
            script
                .into_iter()
                .map(|(output, code)| (output, exited(code)))
                .collect(),
        )
    }

    /// One run that is killed at its deadline after printing `output`.
    pub fn timing_out(output: &str) -> Self {
        Self::scripted(vec![(output, ProbeEnd::TimedOut)])
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

fn exited(code: i32) -> ProbeEnd {
    ProbeEnd::Exited {
        success: code == 0,
        code: Some(code),
    }
}

#[async_trait]
impl ProbeExecutor for FakeExecutor {
    async fn run(&self, args: &[String], _deadline: Duration, stop_rx: &CancellationToken) -> Result<ProbeOutput> {
        self.calls.lock().unwrap().push(args.to_vec());
        if stop_rx.is_cancelled() {
            return Ok(ProbeOutput {
                output: String::new(),
                end: ProbeEnd::Cancelled,
                elapsed: Duration::ZERO,
            });
        }
        let (output, end) = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (String::new(), exited(1)));
        Ok(ProbeOutput {
            output,
            end,
            elapsed: Duration::from_millis(12),
        })
    }
}

pub enum Behaviour {
    Succeed,
    /// The checker itself breaks.
    Error(&'static str),
    /// Stop is requested while the check runs.
    StopDuring(CancellationToken),
}

pub struct FakeChecker {
    task_type: TaskType,
    behaviour: Behaviour,
    pub seen_params: Arc<Mutex<Vec<Parameters>>>,
}

impl FakeChecker {
    pub fn new(task_type: TaskType, behaviour: Behaviour) -> Self {
        Self {
            task_type,
            behaviour,
            seen_params: Arc::new(Mutex::new(vec![])),
        }
    }
}

#[async_trait]
impl Checker for FakeChecker {
    fn task_type(&self) -> TaskType {
        self.task_type.clone()
    }

    async fn check(&self, _target: &str, params: &Parameters, _stop_rx: &CancellationToken) -> Result<CheckResult> {
        self.seen_params.lock().unwrap().push(params.clone());
        match &self.behaviour {
            Behaviour::Succeed => Ok(CheckResult::success(Payload::Tcp(vec![]))),
            Behaviour::Error(message) => Err(anyhow!(*message)),
            Behaviour::StopDuring(stop_rx) => {
                stop_rx.cancel();
                Ok(CheckResult::failed("check cancelled", None))
            }
        }
    }
}
