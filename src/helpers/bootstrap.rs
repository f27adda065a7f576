use std::time::Duration;

use anyhow::{Context, Result};
use human_panic::setup_panic;
use log::{debug, warn};

use crate::helpers::logging;

/// How long in-flight checks and publishes get to settle after the main future returned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Common entry point: panic hook, `.env`, CLI parsing, logging, Tokio runtime.
///
/// `fn_run` is called with the runtime entered, so it may `tokio::spawn` and block on futures.
pub fn run<CliType>(
    fn_cli_parse: fn() -> CliType,
    fn_extract_logging: fn(&CliType) -> &logging::Params,
    fn_run: fn(CliType) -> Result<()>,
) -> Result<()> {
    setup_panic!();
    let env_res = dotenvy::dotenv();

    let cli = fn_cli_parse();
    let logger_handle = logging::configure_from(fn_extract_logging(&cli))?;

    // only now can we actually report what happened to the .env file
    if let Err(env_err) = env_res {
        if env_err.not_found() {
            warn!("No `.env` file found (recursively), relying on args & environment only.")
        } else {
            return Err(env_err).context("Failed to load `.env` file");
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start Tokio runtime")?;
    let command_result = {
        let _guard = runtime.enter();
        fn_run(cli)
    };

    debug!(
        "Waiting up to {}s for remaining tasks to finish",
        SHUTDOWN_GRACE.as_secs()
    );
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    // Important with non-direct write mode
    // Handle needs to be kept alive until end of program
    logger_handle.flush();

    command_result
}
