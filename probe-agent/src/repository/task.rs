use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, trace, warn};
use queue_models::task::Task;
use tokio::select;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use super::{FetchError, TaskConsumer};

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    /// Wall-clock window one fetch may spend collecting tasks.
    pub window: Duration,
    pub max_batch: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CommitPolicy {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    /// Wait before attempt `n + 1` is `n * backoff_base`.
    pub backoff_base: Duration,
}

/// Tracks which fetched tasks are still un-acked and commits them with bounded retry.
pub struct TaskRepository {
    consumer: Arc<dyn TaskConsumer>,
    in_flight: Mutex<HashMap<String, u64>>,
    fetch: FetchPolicy,
    commit: CommitPolicy,
}

impl TaskRepository {
    pub fn new(consumer: Arc<dyn TaskConsumer>, fetch: FetchPolicy, commit: CommitPolicy) -> Self {
        Self {
            consumer,
            in_flight: Mutex::new(HashMap::new()),
            fetch,
            commit,
        }
    }

    /// Collects up to `max_batch` tasks within the fetch window. Running out of time or being
    /// stopped is not an error, the tasks collected so far are returned.
    /// Other failures keep their [FetchError] in the chain, so callers can downcast.
    pub async fn fetch_tasks(&self, stop_rx: &CancellationToken) -> Result<Vec<Task>> {
        let deadline = Instant::now() + self.fetch.window;
        let mut tasks = vec![];
        while tasks.len() < self.fetch.max_batch {
            match self.consumer.fetch(stop_rx, deadline).await {
                Ok((task, delivery_tag)) => {
                    self.track(&task.id, delivery_tag).await;
                    tasks.push(task);
                }
                Err(FetchError::DeadlineExceeded) => break,
                Err(FetchError::Cancelled) => {
                    trace!("Fetch cancelled with {} tasks collected", tasks.len());
                    break;
                }
                Err(e) => {
                    for task in &tasks {
                        self.nack_task(&task.id).await;
                    }
                    return Err(anyhow::Error::new(e)).context("failed to fetch tasks");
                }
            }
        }
        Ok(tasks)
    }

    async fn track(&self, task_id: &str, delivery_tag: u64) {
        let previous = self.lock_in_flight().insert(task_id.to_string(), delivery_tag);
        if let Some(older_tag) = previous {
            warn!(
                "Task {} delivered again while in flight, releasing older delivery {}",
                task_id, older_tag
            );
            self.release(task_id, older_tag).await;
        }
    }

    /// Commits the delivery of `task_id`. Unknown ids are a no-op. Once all attempts failed, the
    /// delivery is released for redelivery. When stopped mid-way, an attempt may already have
    /// reached the broker, so the delivery is left to the channel shutdown.
    pub async fn ack_task(
        &self,
        stop_rx: &CancellationToken,
        deadline: Option<Instant>,
        task_id: &str,
    ) -> Result<()> {
        let Some(delivery_tag) = self.lock_in_flight().remove(task_id) else {
            debug!("Nothing in flight for task {}, not acking", task_id);
            return Ok(());
        };

        let mut last_err = anyhow!("no commit attempt was made");
        for attempt in 1..=self.commit.attempts {
            let attempt_deadline = self.attempt_deadline(deadline);
            if attempt_deadline <= Instant::now() {
                self.release(task_id, delivery_tag).await;
                return Err(last_err)
                    .with_context(|| format!("deadline passed while acking task {}", task_id));
            }
            let commit_fut = timeout_at(attempt_deadline, self.consumer.commit(delivery_tag));
            let res = select! {
                biased;
                _ = stop_rx.cancelled() => bail!("stop requested while acking task {}", task_id),
                res = commit_fut => res,
            };
            match res {
                Ok(Ok(())) => {
                    trace!("Task {} acked on attempt {}", task_id, attempt);
                    return Ok(());
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = anyhow!("commit attempt timed out"),
            }
            warn!(
                "Ack attempt {}/{} for task {} failed: {:?}",
                attempt, self.commit.attempts, task_id, last_err
            );

            if attempt < self.commit.attempts {
                let backoff = self.commit.backoff_base * attempt;
                select! {
                    biased;
                    _ = stop_rx.cancelled() => bail!("stop requested while acking task {}", task_id),
                    _ = sleep(backoff) => {}
                }
            }
        }
        self.release(task_id, delivery_tag).await;
        Err(last_err).with_context(|| {
            format!(
                "failed to ack task {} after {} attempts",
                task_id, self.commit.attempts
            )
        })
    }

    fn attempt_deadline(&self, deadline: Option<Instant>) -> Instant {
        let own = Instant::now() + self.commit.attempt_timeout;
        match deadline {
            Some(caller) => caller.min(own),
            None => own,
        }
    }

    /// Hands the delivery back to the broker without committing, so that it is delivered again.
    /// Unknown ids are a no-op.
    pub async fn nack_task(&self, task_id: &str) {
        let removed = self.lock_in_flight().remove(task_id);
        if let Some(delivery_tag) = removed {
            self.release(task_id, delivery_tag).await;
        }
    }

    /// A failed release is only logged: once the channel is gone, the broker requeues anyway.
    async fn release(&self, task_id: &str, delivery_tag: u64) {
        match self.consumer.release(delivery_tag).await {
            Ok(()) => debug!("Task {} released for redelivery", task_id),
            Err(e) => warn!("Unable to release task {} (delivery {}): {:?}", task_id, delivery_tag, e),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        // The map stays consistent even if a holder panicked, every operation is a single call.
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
