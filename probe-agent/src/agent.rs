use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use log::{debug, error, info, trace, warn};
use netprobe::loop_with_stop;
use queue_models::check_result::CheckResult;
use queue_models::log_entry::LogEntry;
use queue_models::task::Task;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::checks::Registry;
use crate::repository::{CommitPolicy, FetchError, FetchPolicy, ResultRepository, TaskRepository};

pub use status::{AgentStatus, HealthError, StatusHandle};

mod status;

#[derive(Args, Debug, Clone)]
#[group(id = "agent")]
pub struct Params {
    /// Identifies this agent in results and logs.
    #[arg(long, env = "AGENT_ID")]
    pub agent_id: String,

    /// How often to poll for a new batch of tasks, in seconds
    #[arg(long, env = "AGENT_POLL_INTERVAL_SECS", default_value = "30")]
    poll_interval_secs: u64,

    /// How long one poll may spend collecting tasks, in seconds
    #[arg(long, env = "AGENT_FETCH_WINDOW_SECS", default_value = "5")]
    fetch_window_secs: u64,

    /// How many tasks to take per poll at most
    #[arg(long, env = "AGENT_BATCH_SIZE", default_value = "100")]
    batch_size: usize,

    /// How often to try acknowledging a task before leaving it for redelivery
    #[arg(long, env = "AGENT_COMMIT_ATTEMPTS", default_value = "3")]
    commit_attempts: u32,

    /// Upper bound for a single acknowledgement attempt, in seconds
    #[arg(long, env = "AGENT_COMMIT_ATTEMPT_TIMEOUT_SECS", default_value = "5")]
    commit_attempt_timeout_secs: u64,

    /// Base of the linear backoff between acknowledgement attempts, in milliseconds
    #[arg(long, env = "AGENT_COMMIT_BACKOFF_MS", default_value = "500")]
    commit_backoff_ms: u64,
}

impl Params {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            window: Duration::from_secs(self.fetch_window_secs),
            max_batch: self.batch_size.max(1),
        }
    }

    pub fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            attempts: self.commit_attempts.max(1),
            attempt_timeout: Duration::from_secs(self.commit_attempt_timeout_secs),
            backoff_base: Duration::from_millis(self.commit_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Processed,
    /// No checker for the task type.
    Skipped,
    Failed,
    /// Stop was requested, the task is left for redelivery.
    Interrupted,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct BatchSummary {
    total: usize,
    processed: usize,
    skipped: usize,
    failed: usize,
    interrupted: usize,
}

impl BatchSummary {
    fn count(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Processed => self.processed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Interrupted => self.interrupted += 1,
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} processed, {} skipped, {} failed",
            self.total, self.processed, self.skipped, self.failed
        )?;
        if self.interrupted > 0 {
            write!(f, ", {} left for redelivery", self.interrupted)?;
        }
        Ok(())
    }
}

/// Timer-driven fetch & dispatch cycle. Tasks of a batch run one after the other.
pub struct Agent {
    agent_id: String,
    tasks: TaskRepository,
    results: ResultRepository,
    registry: Arc<Registry>,
    poll_interval: Duration,
    stop_rx: CancellationToken,
    running: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(
        params: &Params,
        tasks: TaskRepository,
        results: ResultRepository,
        registry: Arc<Registry>,
        stop_rx: CancellationToken,
    ) -> Self {
        Self {
            agent_id: params.agent_id.clone(),
            tasks,
            results,
            registry,
            poll_interval: params.poll_interval(),
            stop_rx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle::new(
            self.agent_id.clone(),
            self.running.clone(),
            self.poll_interval,
            self.registry.len(),
        )
    }

    pub async fn run(mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Agent is ready for work: {:?}", self.status_handle().status());
        let res = self.run_until_stopped().await;
        self.running.store(false, Ordering::SeqCst);
        if self.tasks.in_flight() > 0 {
            warn!("{} tasks still un-acked at shutdown, they will be redelivered", self.tasks.in_flight());
        }
        res
    }

    async fn run_until_stopped(&mut self) -> Result<()> {
        let mut trigger = interval(self.poll_interval);
        trigger.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stop_rx = self.stop_rx.clone();
        loop_with_stop!(
            "agent loop", stop_rx,
            trigger.tick() => tick(it) on self as simple
        )
    }

    /// Errors are logged and retried on the next tick, except for a closed delivery stream:
    /// that one ends the loop, since no further task can arrive on it.
    async fn tick(&mut self, _it: Instant) -> Result<()> {
        match self.process_batch().await {
            Err(e) if is_delivery_lost(&e) => Err(e.context("task delivery is gone, stopping agent")),
            Err(e) => {
                error!("Failed to process task batch due to {:?}", e);
                Ok(())
            }
            ok => ok,
        }
    }

    async fn process_batch(&mut self) -> Result<()> {
        let tasks = self.tasks.fetch_tasks(&self.stop_rx).await?;
        if tasks.is_empty() {
            trace!("No tasks received this round.");
            return Ok(());
        }

        let start = Instant::now();
        let mut summary = BatchSummary {
            total: tasks.len(),
            ..Default::default()
        };
        for (idx, task) in tasks.iter().enumerate() {
            if self.stop_rx.is_cancelled() {
                for left in &tasks[idx..] {
                    self.tasks.nack_task(&left.id).await;
                    summary.count(TaskOutcome::Interrupted);
                }
                break;
            }
            let outcome = self.process_task(task).await;
            summary.count(outcome);
        }
        info!("Task batch done in {}ms: {}", start.elapsed().as_millis(), summary);
        Ok(())
    }

    async fn process_task(&self, task: &Task) -> TaskOutcome {
        self.emit_log(LogEntry::info(
            &task.id,
            &self.agent_id,
            format!("Received {} task for {}", task.task_type, task.target),
        ))
        .await;

        let Some(checker) = self.registry.get(&task.task_type) else {
            return self.skip_unsupported(task).await;
        };

        let started = Instant::now();
        let params = task.check_parameters();
        let result = match checker.check(&task.target, &params, &self.stop_rx).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("{:#}", e);
                self.emit_log(LogEntry::error(
                    &task.id,
                    &self.agent_id,
                    format!("Checker execution failed: {}", message),
                ))
                .await;
                CheckResult::failed(message, None)
            }
        };
        if self.stop_rx.is_cancelled() {
            debug!("Stop requested during check of task {}, leaving it for redelivery", task.id);
            self.tasks.nack_task(&task.id).await;
            return TaskOutcome::Interrupted;
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = result.stamp(&task.id, &self.agent_id, duration_ms);
        if let Err(e) = self.results.send_result(&result).await {
            error!("Leaving task {} for redelivery: {:?}", task.id, e);
            self.tasks.nack_task(&task.id).await;
            return TaskOutcome::Failed;
        }

        let acked = self.tasks.ack_task(&self.stop_rx, None, &task.id).await;
        self.emit_log(LogEntry::info(
            &task.id,
            &self.agent_id,
            format!("Check completed with status: {}", result.status),
        ))
        .await;
        match acked {
            Ok(()) => TaskOutcome::Processed,
            Err(e) => {
                warn!("Result of task {} published, but ack failed: {:?}", task.id, e);
                TaskOutcome::Failed
            }
        }
    }

    async fn skip_unsupported(&self, task: &Task) -> TaskOutcome {
        self.emit_log(LogEntry::error(
            &task.id,
            &self.agent_id,
            format!("No checker available for task type: {}", task.task_type),
        ))
        .await;
        let result = CheckResult::failed(format!("unsupported task type: {}", task.task_type), None)
            .stamp(&task.id, &self.agent_id, 0);
        if let Err(e) = self.results.send_result(&result).await {
            warn!("Failed to report unsupported task {}: {:?}", task.id, e);
        }
        self.tasks.nack_task(&task.id).await;
        TaskOutcome::Skipped
    }

    /// Task logs are best effort.
    async fn emit_log(&self, entry: LogEntry) {
        if let Err(e) = self.results.send_log(&entry).await {
            warn!("Dropping task log {:?}: {:?}", entry.message, e);
        }
    }
}

fn is_delivery_lost(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<FetchError>(), Some(FetchError::ChannelClosed(_)))
}

#[cfg(test)]
mod tests {
    use assertor::*;
    use queue_models::task::TaskType;
    use serde_json::{json, Value};

    use crate::test_utils::{task, Behaviour, FakeChecker, FakeConsumer, FakePublisher};

    use super::*;

    struct Fixture {
        consumer: Arc<FakeConsumer>,
        results: Arc<FakePublisher>,
        logs: Arc<FakePublisher>,
        stop_rx: CancellationToken,
        agent: Agent,
    }

    fn fixture(tasks: Vec<Task>, results: FakePublisher, checkers: Vec<FakeChecker>) -> Fixture {
        let consumer = Arc::new(FakeConsumer::with_tasks(tasks));
        let results = Arc::new(results);
        let logs = Arc::new(FakePublisher::default());
        let stop_rx = CancellationToken::new();
        let mut registry = Registry::default();
        for checker in checkers {
            registry.register(Arc::new(checker));
        }
        let agent = Agent {
            agent_id: "agent-1".to_string(),
            tasks: TaskRepository::new(
                consumer.clone(),
                FetchPolicy {
                    window: Duration::from_millis(100),
                    max_batch: 100,
                },
                CommitPolicy {
                    attempts: 3,
                    attempt_timeout: Duration::from_secs(1),
                    backoff_base: Duration::from_millis(1),
                },
            ),
            results: ResultRepository::new(results.clone(), logs.clone()),
            registry: Arc::new(registry),
            poll_interval: Duration::from_millis(50),
            stop_rx: stop_rx.clone(),
            running: Arc::new(AtomicBool::new(false)),
        };
        Fixture {
            consumer,
            results,
            logs,
            stop_rx,
            agent,
        }
    }

    fn messages(publisher: &FakePublisher) -> Vec<String> {
        publisher
            .published()
            .iter()
            .map(|(_, record)| record["message"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn successful_check_is_published_then_acked() {
        // given
        let mut fx = fixture(
            vec![task("t-1", "ping")],
            FakePublisher::default(),
            vec![FakeChecker::new(TaskType::Ping, Behaviour::Succeed)],
        );

        // when
        fx.agent.process_batch().await.unwrap();

        // then
        let published = fx.results.published();
        assert_that!(published.len()).is_equal_to(1);
        assert_that!(published[0].0.as_str()).is_equal_to("t-1");
        assert_that!(published[0].1["status"]).is_equal_to(json!("success"));
        assert_that!(published[0].1["agent_id"]).is_equal_to(json!("agent-1"));
        assert_that!(fx.consumer.committed()).is_equal_to(vec![1]);
        assert_that!(messages(&fx.logs)).is_equal_to(vec![
            "Received ping task for 127.0.0.1".to_string(),
            "Check completed with status: success".to_string(),
        ]);
    }

    #[tokio::test]
    async fn unknown_type_is_reported_and_nacked() {
        // given
        let mut fx = fixture(vec![task("t-1", "smtp")], FakePublisher::default(), vec![]);

        // when
        fx.agent.process_batch().await.unwrap();

        // then
        let published = fx.results.published();
        assert_that!(published.len()).is_equal_to(1);
        assert_that!(published[0].1["status"]).is_equal_to(json!("failed"));
        assert_that!(published[0].1["error"]).is_equal_to(json!("unsupported task type: smtp"));
        assert_that!(published[0].1["payload"]).is_equal_to(Value::Null);
        assert_that!(fx.consumer.commit_calls.load(Ordering::SeqCst)).is_equal_to(0);
        assert_that!(fx.consumer.released()).is_equal_to(vec![1]);
        assert_that!(fx.agent.tasks.in_flight()).is_equal_to(0);
        assert_that!(messages(&fx.logs)).contains("No checker available for task type: smtp".to_string());
    }

    #[tokio::test]
    async fn checker_error_becomes_failed_result() {
        // given
        let mut fx = fixture(
            vec![task("t-1", "ping")],
            FakePublisher::default(),
            vec![FakeChecker::new(TaskType::Ping, Behaviour::Error("ping binary missing"))],
        );

        // when
        fx.agent.process_batch().await.unwrap();

        // then
        let published = fx.results.published();
        assert_that!(published[0].1["status"]).is_equal_to(json!("failed"));
        assert_that!(published[0].1["error"]).is_equal_to(json!("ping binary missing"));
        assert_that!(fx.consumer.committed()).is_equal_to(vec![1]);
        assert_that!(messages(&fx.logs)).contains("Checker execution failed: ping binary missing".to_string());
    }

    #[tokio::test]
    async fn publish_failure_leaves_task_for_redelivery() {
        // given
        let mut fx = fixture(
            vec![task("t-1", "ping")],
            FakePublisher::failing(),
            vec![FakeChecker::new(TaskType::Ping, Behaviour::Succeed)],
        );

        // when
        fx.agent.process_batch().await.unwrap();

        // then
        assert_that!(fx.consumer.commit_calls.load(Ordering::SeqCst)).is_equal_to(0);
        assert_that!(fx.consumer.released()).is_equal_to(vec![1]);
        assert_that!(fx.agent.tasks.in_flight()).is_equal_to(0);
    }

    #[tokio::test]
    async fn stop_during_check_skips_publish_and_rest_of_batch() {
        // given
        let stop_rx = CancellationToken::new();
        let mut fx = fixture(
            vec![task("t-1", "ping"), task("t-2", "ping")],
            FakePublisher::default(),
            vec![FakeChecker::new(TaskType::Ping, Behaviour::StopDuring(stop_rx.clone()))],
        );
        fx.agent.stop_rx = stop_rx;

        // when
        fx.agent.process_batch().await.unwrap();

        // then
        assert_that!(fx.results.published().is_empty()).is_true();
        assert_that!(fx.consumer.commit_calls.load(Ordering::SeqCst)).is_equal_to(0);
        assert_that!(fx.consumer.released()).is_equal_to(vec![1, 2]);
        assert_that!(fx.agent.tasks.in_flight()).is_equal_to(0);
    }

    #[tokio::test]
    async fn task_timeout_reaches_checker() {
        // given
        let mut with_timeout = task("t-1", "ping");
        with_timeout.timeout = Some(7);
        let checker = FakeChecker::new(TaskType::Ping, Behaviour::Succeed);
        let seen = checker.seen_params.clone();
        let mut fx = fixture(vec![with_timeout], FakePublisher::default(), vec![checker]);

        // when
        fx.agent.process_batch().await.unwrap();

        // then
        assert_that!(seen.lock().unwrap()[0].get("timeout")).has_value(&json!(7));
    }

    #[tokio::test]
    async fn run_reports_status_until_stopped() {
        // given
        let fx = fixture(vec![], FakePublisher::default(), vec![]);
        let status = fx.agent.status_handle();
        let stopper = fx.stop_rx.clone();

        // when
        let running = tokio::spawn(fx.agent.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let while_running = status.health_check();
        stopper.cancel();
        running.await.unwrap().unwrap();

        // then
        assert_that!(while_running.is_ok()).is_true();
        assert_that!(status.health_check()).is_equal_to(Err(HealthError::NotRunning));
        assert_that!(status.status().checker_count).is_equal_to(0);
    }

    #[tokio::test]
    async fn closed_delivery_stream_stops_the_agent() {
        // given
        let fx = fixture(vec![], FakePublisher::default(), vec![]);
        fx.consumer.close_after_drain();
        let status = fx.agent.status_handle();

        // when
        let res = tokio::time::timeout(Duration::from_secs(5), fx.agent.run()).await;

        // then
        let res = res.expect("agent should stop on its own");
        assert_that!(res.is_err()).is_true();
        assert_that!(is_delivery_lost(&res.unwrap_err())).is_true();
        assert_that!(status.health_check()).is_equal_to(Err(HealthError::NotRunning));
    }

    #[tokio::test]
    async fn only_closed_stream_counts_as_delivery_loss() {
        // given
        let e = anyhow::Error::new(FetchError::Other(anyhow::anyhow!("decode hiccup")))
            .context("failed to fetch tasks");

        // then
        assert_that!(is_delivery_lost(&e)).is_false();
    }

    #[test]
    fn summary_mentions_all_counts() {
        // given
        let mut summary = BatchSummary {
            total: 3,
            ..Default::default()
        };

        // when
        summary.count(TaskOutcome::Processed);
        summary.count(TaskOutcome::Skipped);
        summary.count(TaskOutcome::Failed);

        // then
        assert_that!(summary.to_string()).is_equal_to("3 total, 1 processed, 1 skipped, 1 failed".to_string());
    }
}
