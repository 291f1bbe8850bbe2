//! Console transport: opening the guest's serial console channel and
//! pumping bytes in each direction.
//!
//! The channel only exists once the VM has booted far enough, so opening is
//! retried until a deadline. Both directions run concurrently on the same
//! channel; on Windows the pipe is opened for overlapped I/O so a pending
//! read never blocks a write.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::line_ending::LineEndingNormalizer;
use crate::ConsoleError;

/// Default budget for the channel to appear.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between open attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const ERROR_BROKEN_PIPE: i32 = 109;
const ERROR_PIPE_BUSY: i32 = 231;
const ERROR_NO_DATA: i32 = 232;
const ERROR_PIPE_NOT_CONNECTED: i32 = 233;

const GUEST_READ_CHUNK: usize = 4096;
const HOST_READ_CHUNK: usize = 256;

/// Opens a named duplex channel to a guest console.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connected channel type.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Make one attempt to open `name`.
    async fn connect(&self, name: &str) -> io::Result<Self::Stream>;
}

/// Named-pipe client, opened for overlapped I/O.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NamedPipeConnector;

#[cfg(windows)]
#[async_trait]
impl ChannelConnector for NamedPipeConnector {
    type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

    async fn connect(&self, name: &str) -> io::Result<Self::Stream> {
        tokio::net::windows::named_pipe::ClientOptions::new().open(name)
    }
}

/// Unix-domain-socket client; the channel name is the socket path.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSocketConnector;

#[cfg(unix)]
#[async_trait]
impl ChannelConnector for UnixSocketConnector {
    type Stream = tokio::net::UnixStream;

    async fn connect(&self, name: &str) -> io::Result<Self::Stream> {
        tokio::net::UnixStream::connect(name).await
    }
}

/// Connector for this platform's console channels.
#[cfg(windows)]
pub type DefaultConnector = NamedPipeConnector;

/// Connector for this platform's console channels.
#[cfg(unix)]
pub type DefaultConnector = UnixSocketConnector;

/// `true` for errors that mean "not there yet": the channel does not exist,
/// is refusing, or all its instances are busy.
#[must_use]
pub fn is_transient_open_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    ) || err.raw_os_error() == Some(ERROR_PIPE_BUSY)
}

/// `true` when `err` means the peer closed or disconnected. Forwarding loops
/// treat this as a normal end of stream.
#[must_use]
pub fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    ) || matches!(
        err.raw_os_error(),
        Some(ERROR_BROKEN_PIPE | ERROR_NO_DATA | ERROR_PIPE_NOT_CONNECTED)
    )
}

/// Open `name`, retrying every `interval` while it is not yet available.
///
/// Only the overall deadline turns "not yet available" into a failure; an
/// error that retrying cannot fix is returned at once.
///
/// # Errors
/// - [`ConsoleError::OpenTimeout`] once `timeout` has elapsed.
/// - [`ConsoleError::Open`] for a non-transient open failure.
pub async fn open_duplex<C: ChannelConnector + ?Sized>(
    connector: &C,
    name: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<C::Stream, ConsoleError> {
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match connector.connect(name).await {
            Ok(stream) => {
                tracing::debug!(pipe = %name, attempts, "console channel open");
                return Ok(stream);
            }
            Err(e) if is_transient_open_error(&e) => {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(pipe = %name, attempts, "console channel never appeared");
                    return Err(ConsoleError::OpenTimeout {
                        name: name.to_owned(),
                        timeout,
                    });
                }
                tracing::trace!(pipe = %name, error = %e, "console channel not ready");
                tokio::time::sleep(interval.min(deadline - now)).await;
            }
            Err(source) => {
                return Err(ConsoleError::Open {
                    name: name.to_owned(),
                    source,
                })
            }
        }
    }
}

/// Copy guest output to the host verbatim until the channel closes.
///
/// # Errors
/// [`ConsoleError::Channel`] on a read failure other than peer close,
/// [`ConsoleError::Host`] if writing to `host` fails.
pub async fn forward_to_stdout<R, W>(mut channel: R, mut host: W) -> Result<(), ConsoleError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; GUEST_READ_CHUNK];
    loop {
        let n = match channel.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_peer_closed(&e) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ConsoleError::Channel(e)),
        };
        tracing::trace!(bytes = n, "guest -> host");
        host.write_all(&buf[..n]).await.map_err(ConsoleError::Host)?;
        host.flush().await.map_err(ConsoleError::Host)?;
    }
    tracing::debug!("console channel closed by guest");
    Ok(())
}

/// Copy host input to the guest, normalizing line endings, until host input
/// ends or the channel closes.
///
/// With `trace` set every chunk written is logged.
///
/// # Errors
/// [`ConsoleError::Host`] on a host read failure, [`ConsoleError::Channel`]
/// on a write failure other than peer close.
pub async fn forward_from_stdin<R, W>(mut host: R, mut channel: W, trace: bool) -> Result<(), ConsoleError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut normalizer = LineEndingNormalizer::new();
    let mut buf = vec![0u8; HOST_READ_CHUNK];
    let mut out = Vec::with_capacity(HOST_READ_CHUNK);
    loop {
        let n = match host.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ConsoleError::Host(e)),
        };
        out.clear();
        normalizer.push(&buf[..n], &mut out);
        if out.is_empty() {
            continue;
        }
        let written = match channel.write_all(&out).await {
            Ok(()) => channel.flush().await,
            Err(e) => Err(e),
        };
        if trace {
            tracing::info!(data = %out.escape_ascii(), bytes = out.len(), "host -> guest");
        }
        match written {
            Ok(()) => {}
            Err(e) if is_peer_closed(&e) => return Ok(()),
            Err(e) => return Err(ConsoleError::Channel(e)),
        }
    }
    tracing::debug!("host input closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails with `error` until `ready_after` has elapsed, then hands out one
    /// end of a duplex pipe.
    struct DelayedConnector {
        created: Instant,
        ready_after: Option<Duration>,
        error: io::ErrorKind,
        attempts: AtomicU32,
    }

    impl DelayedConnector {
        fn new(ready_after: Option<Duration>, error: io::ErrorKind) -> Self {
            Self {
                created: Instant::now(),
                ready_after,
                error,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChannelConnector for DelayedConnector {
        type Stream = tokio::io::DuplexStream;

        async fn connect(&self, _name: &str) -> io::Result<Self::Stream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.ready_after {
                Some(after) if self.created.elapsed() >= after => Ok(tokio::io::duplex(64).0),
                _ => Err(io::Error::from(self.error)),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_succeeds_once_channel_appears() {
        let connector = DelayedConnector::new(Some(Duration::from_millis(250)), io::ErrorKind::NotFound);
        let started = Instant::now();

        let opened = open_duplex(&connector, "vm-console", Duration::from_secs(2), DEFAULT_RETRY_INTERVAL).await;
        assert!(opened.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn open_fails_only_after_full_timeout() {
        let connector = DelayedConnector::new(None, io::ErrorKind::NotFound);
        let started = Instant::now();

        let opened = open_duplex(&connector, "vm-console", Duration::from_secs(2), DEFAULT_RETRY_INTERVAL).await;
        assert!(matches!(opened, Err(ConsoleError::OpenTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_pipe_is_retried() {
        let connector = DelayedConnector::new(Some(Duration::from_millis(150)), io::ErrorKind::ConnectionRefused);
        let opened = open_duplex(&connector, "vm-console", Duration::from_secs(2), DEFAULT_RETRY_INTERVAL).await;
        assert!(opened.is_ok());
        assert!(is_transient_open_error(&io::Error::from_raw_os_error(ERROR_PIPE_BUSY)));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_open_error_is_not_retried() {
        let connector = DelayedConnector::new(None, io::ErrorKind::PermissionDenied);
        let started = Instant::now();

        let opened = open_duplex(&connector, "vm-console", Duration::from_secs(2), DEFAULT_RETRY_INTERVAL).await;
        assert!(matches!(opened, Err(ConsoleError::Open { .. })));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < DEFAULT_RETRY_INTERVAL);
    }

    #[test]
    fn peer_close_errors_are_recognised() {
        assert!(is_peer_closed(&io::Error::from_raw_os_error(ERROR_BROKEN_PIPE)));
        assert!(is_peer_closed(&io::Error::from_raw_os_error(ERROR_PIPE_NOT_CONNECTED)));
        assert!(is_peer_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_peer_closed(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_peer_closed(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn guest_output_is_copied_verbatim() {
        let guest: &[u8] = b"line one\r\nline two\r\n";
        let mut host = Vec::new();
        assert!(forward_to_stdout(guest, &mut host).await.is_ok());
        assert_eq!(host, b"line one\r\nline two\r\n");
    }

    #[tokio::test]
    async fn host_input_is_normalized_and_eof_is_clean() {
        let host: &[u8] = b"ls\r\npwd\r";
        let (channel, mut guest) = tokio::io::duplex(64);

        assert!(forward_from_stdin(host, channel, false).await.is_ok());
        let mut received = Vec::new();
        let _ = guest.read_to_end(&mut received).await;
        assert_eq!(received, b"ls\npwd\n");
    }

    #[tokio::test]
    async fn closed_guest_ends_host_forwarding_cleanly() {
        let (channel, guest) = tokio::io::duplex(64);
        drop(guest);
        let host: &[u8] = b"echo\r";
        assert!(forward_from_stdin(host, channel, true).await.is_ok());
    }
}
