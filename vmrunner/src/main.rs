//! Entry point for the `vmrunner` binary.

use std::process::ExitCode;

use clap::Parser;
use vmrunner::{Cli, CliError};

#[tokio::main]
async fn main() -> ExitCode {
    vmrunner::logging::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "vmrunner failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(windows)]
async fn run(cli: Cli) -> Result<(), CliError> {
    use std::sync::Arc;

    use vmrunner_compute::{ControlFacade, VmComputeService};
    use vmrunner_console::DefaultConnector;

    let facade = ControlFacade::with_timeouts(Arc::new(VmComputeService::new()), cli.lifecycle_timeouts());
    tracing::debug!(timeouts = ?facade.timeouts(), "lifecycle timeouts");
    vmrunner::commands::dispatch(cli, &facade, &DefaultConnector::default()).await
}

#[cfg(not(windows))]
#[allow(clippy::unused_async)]
async fn run(cli: Cli) -> Result<(), CliError> {
    tracing::debug!(command = ?cli.command, timeouts = ?cli.lifecycle_timeouts(), "not running on Windows");
    Err(CliError::Unavailable)
}
