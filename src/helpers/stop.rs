use anyhow::{anyhow, Context, Result};
use log::info;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod macros;

pub struct SignalHandler {
    tok: CancellationToken,
}

pub fn new() -> SignalHandler {
    SignalHandler {
        tok: CancellationToken::new(),
    }
}

impl SignalHandler {
    pub fn subscribe_stop(&self) -> CancellationToken {
        self.tok.clone()
    }

    /// Waits for SIGTERM, SIGINT or SIGHUP and cancels the stop token afterwards.
    /// The token is also cancelled if the handlers cannot be installed, so nobody waits forever.
    pub async fn wait_for_signal(self) -> Result<()> {
        let res = self.wait_inner().await;
        self.tok.cancel();
        res
    }

    async fn wait_inner(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

        select! {
            _ = sigterm.recv() => info!("Terminated; stopping..."),
            _ = sigint.recv() => info!("Interrupted; stopping..."),
            _ = sighup.recv() => info!("Hangup received; stopping..."), // used by tmux apparently
            _ = self.tok.cancelled() => info!("Stop requested internally; stopping..."),
        }
        Ok(())
    }
}

pub async fn flatten(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}
