use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::Level::Debug;
use log::{debug, log_enabled, trace};
use tokio::process::Command;
use tokio::select;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEnd {
    Exited { success: bool, code: Option<i32> },
    /// Killed after the deadline passed.
    TimedOut,
    /// Killed because stop was requested.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProbeOutput {
    /// stdout followed by stderr
    pub output: String,
    pub end: ProbeEnd,
    pub elapsed: Duration,
}

/// Runs the external probe program (`ping`) with the given arguments.
/// Failing to start the program is an `Err`; everything after that is in [ProbeOutput].
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn run(
        &self,
        args: &[String],
        deadline: Duration,
        stop_rx: &CancellationToken,
    ) -> Result<ProbeOutput>;
}

#[derive(Debug)]
pub struct SystemExecutor {
    bin_path: String,
}

impl SystemExecutor {
    pub fn new(bin_path: String) -> Self {
        Self { bin_path }
    }
}

#[async_trait]
impl ProbeExecutor for SystemExecutor {
    async fn run(
        &self,
        args: &[String],
        deadline: Duration,
        stop_rx: &CancellationToken,
    ) -> Result<ProbeOutput> {
        if log_enabled!(Debug) {
            debug!("Calling {} with args: {}", self.bin_path, args.join(" "));
        }
        let mut cmd = Command::new(&self.bin_path);
        cmd.args(args)
            // parsers expect the untranslated output
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn probe process {}", self.bin_path))?;

        let (output, end) = select! {
            biased;
            _ = stop_rx.cancelled() => (String::new(), ProbeEnd::Cancelled),
            _ = sleep(deadline) => (String::new(), ProbeEnd::TimedOut),
            res = child.wait_with_output() => {
                let out = res.with_context(|| format!("Failed to collect output of {}", self.bin_path))?;
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                let end = ProbeEnd::Exited { success: out.status.success(), code: out.status.code() };
                (combined, end)
            }
        };
        let elapsed = started.elapsed();
        trace!("{} ended with {:?} after {:?}: {}", self.bin_path, end, elapsed, output);
        Ok(ProbeOutput { output, end, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        // given
        let executor = SystemExecutor::new("/nonexistent/ping".to_string());

        // when
        let res = executor
            .run(&["-c".to_string(), "1".to_string()], Duration::from_secs(1), &CancellationToken::new())
            .await;

        // then
        assert_that!(res.is_err()).is_true();
    }

    #[tokio::test]
    async fn slow_process_is_killed_at_deadline() {
        // given
        let executor = SystemExecutor::new("sleep".to_string());

        // when
        let started = Instant::now();
        let out = executor
            .run(&["10".to_string()], Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap();

        // then
        assert_that!(out.end).is_equal_to(ProbeEnd::TimedOut);
        assert_that!(started.elapsed() < Duration::from_secs(5)).is_true();
    }

    #[tokio::test]
    async fn output_and_exit_code_are_captured() {
        // given
        let executor = SystemExecutor::new("sh".to_string());

        // when
        let out = executor
            .run(
                &["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()],
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // then
        assert_that!(out.output).is_equal_to("hello\noops\n".to_string());
        assert_that!(out.end).is_equal_to(ProbeEnd::Exited {
            success: false,
            code: Some(3),
        });
    }
}
