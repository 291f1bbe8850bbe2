//! Session drivers over the console transport.
//!
//! An interactive session pumps both directions at once until either side
//! ends. A one-shot command waits for the shell prompt, sends the command
//! line and forwards output until the next prompt.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::AbortHandle;
use vmrunner_core::shell_join;

use crate::prompt::{collect_until_prompt, wait_for_prompt};
use crate::transport::{
    forward_from_stdin, forward_to_stdout, open_duplex, ChannelConnector, DEFAULT_OPEN_TIMEOUT,
    DEFAULT_RETRY_INTERVAL,
};
use crate::ConsoleError;

/// Options threaded through a console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct SessionOptions {
    /// Log every chunk sent to the guest.
    pub trace: bool,
    /// How long to wait for the console channel to appear.
    pub open_timeout: Duration,
    /// Delay between open attempts.
    pub retry_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            trace: false,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

/// Aborts a spawned forwarding task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Forward `channel` to `host_out` and `host_in` to `channel` concurrently.
///
/// Returns as soon as either direction finishes; the other is abandoned.
/// Dropping the returned future stops both directions, which also drops
/// `host_in` and with it any raw terminal mode it holds.
///
/// # Errors
/// The error of whichever direction finished first, if it failed.
pub async fn interactive_session<S, I, O>(
    channel: S,
    host_in: I,
    host_out: O,
    options: &SessionOptions,
) -> Result<(), ConsoleError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(channel);
    let mut guest_to_host = tokio::spawn(forward_to_stdout(reader, host_out));
    let mut host_to_guest = tokio::spawn(forward_from_stdin(host_in, writer, options.trace));
    let _guards = [
        AbortOnDrop(guest_to_host.abort_handle()),
        AbortOnDrop(host_to_guest.abort_handle()),
    ];

    let finished = tokio::select! {
        result = &mut guest_to_host => {
            tracing::debug!("guest output ended, closing session");
            result
        }
        result = &mut host_to_guest => {
            tracing::debug!("host input ended, closing session");
            result
        }
    };
    finished?
}

/// Open the console channel `name` and run an interactive session between
/// it and the given host streams.
///
/// # Errors
/// Open failures from [`open_duplex`] and session errors from
/// [`interactive_session`].
pub async fn attach<C, I, O>(
    connector: &C,
    name: &str,
    host_in: I,
    host_out: O,
    options: &SessionOptions,
) -> Result<(), ConsoleError>
where
    C: ChannelConnector + ?Sized,
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
{
    let channel = open_duplex(connector, name, options.open_timeout, options.retry_interval).await?;
    tracing::info!(pipe = %name, "connected to serial console");
    interactive_session(channel, host_in, host_out, options).await
}

/// Run one command over an open console and return everything it printed,
/// up to and including the next prompt.
///
/// Guest output, including the initial prompt, is forwarded to `sink` as it
/// arrives.
///
/// # Errors
/// [`ConsoleError::ClosedBeforePrompt`] if the console closes before either
/// prompt, or any channel or host I/O error.
pub async fn run_command<S, A, W>(channel: S, args: &[A], sink: &mut W) -> Result<Vec<u8>, ConsoleError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    A: AsRef<str>,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut channel = BufReader::new(channel);

    wait_for_prompt(&mut channel, sink).await?;

    let mut line = shell_join(args);
    tracing::debug!(command = %line, "sending command to guest shell");
    line.push('\n');
    channel.write_all(line.as_bytes()).await.map_err(ConsoleError::Channel)?;
    channel.flush().await.map_err(ConsoleError::Channel)?;

    collect_until_prompt(&mut channel, sink).await
}

/// Open the console channel `name` and run one command on it, echoing guest
/// output to stdout.
///
/// # Errors
/// As [`open_duplex`] and [`run_command`].
pub async fn exec_command<C, A>(
    connector: &C,
    name: &str,
    args: &[A],
    options: &SessionOptions,
) -> Result<Vec<u8>, ConsoleError>
where
    C: ChannelConnector + ?Sized,
    A: AsRef<str>,
{
    let channel = open_duplex(connector, name, options.open_timeout, options.retry_interval).await?;
    tracing::info!(pipe = %name, "connected to serial console");
    run_command(channel, args, &mut tokio::io::stdout()).await
}
