//! Error types for the console crate.

use std::io;
use std::time::Duration;

/// Errors surfaced by the console transport and session drivers.
///
/// A peer closing the channel is not an error; forwarding loops end cleanly
/// on it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConsoleError {
    /// The channel never became available within the retry budget.
    #[error("timed out waiting for console {name:?} after {timeout:?}")]
    OpenTimeout { name: String, timeout: Duration },

    /// Opening the channel failed with an error that retrying cannot fix.
    #[error("open console {name:?}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Reading from or writing to the guest channel failed.
    #[error("console channel I/O: {0}")]
    Channel(#[source] io::Error),

    /// Reading host input or writing host output failed.
    #[error("host terminal I/O: {0}")]
    Host(#[source] io::Error),

    /// The channel closed before the guest shell printed a prompt.
    #[error("console closed before the shell prompt appeared")]
    ClosedBeforePrompt,

    /// A forwarding task panicked.
    #[error("console forwarding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ConsoleError {
    /// `true` if the channel never showed up in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::OpenTimeout { .. })
    }
}
