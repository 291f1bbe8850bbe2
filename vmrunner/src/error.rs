//! Error types for the command-line front end.

use vmrunner_compute::ControlError;
use vmrunner_console::ConsoleError;
use vmrunner_core::CoreError;

/// Errors that end a vmrunner invocation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliError {
    /// A lifecycle operation failed.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// The console session failed.
    #[error(transparent)]
    Console(#[from] ConsoleError),

    /// The command-line options do not form a valid VM configuration.
    #[error(transparent)]
    Config(#[from] CoreError),

    /// The Host Compute Service does not exist on this platform.
    #[error("the Host Compute Service is only available on Windows")]
    Unavailable,
}
