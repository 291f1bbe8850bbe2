//! Host terminal adapter.
//!
//! Puts the host terminal into a raw input mode for the duration of an
//! interactive session: keystrokes reach the guest one at a time, the host
//! does not echo them (the guest shell does), and the interrupt key still
//! works. The original mode is restored when the [`HostInput`] is dropped.
//!
//! When stdin is not a terminal nothing is changed and input is read as is.
//! Line endings are normalized later, on the way to the guest.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win_console;

#[cfg(unix)]
use unix::read_raw;
#[cfg(unix)]
pub use unix::RawModeGuard;
#[cfg(windows)]
use win_console::read_raw;
#[cfg(windows)]
pub use win_console::RawModeGuard;

/// Console input mode bits.
pub mod console_mode {
    /// Ctrl+C is processed by the system.
    pub const PROCESSED_INPUT: u32 = 0x0001;
    /// Input is returned a line at a time.
    pub const LINE_INPUT: u32 = 0x0002;
    /// Typed characters are echoed locally.
    pub const ECHO_INPUT: u32 = 0x0004;
    /// Input arrives as virtual terminal sequences.
    pub const VIRTUAL_TERMINAL_INPUT: u32 = 0x0200;
}

/// Raw-session console mode derived from the current one.
///
/// Clears line buffering and local echo, sets virtual terminal input and
/// leaves every other bit, interrupt processing included, as it was.
#[must_use]
pub fn raw_input_mode(current: u32) -> u32 {
    use console_mode::{ECHO_INPUT, LINE_INPUT, VIRTUAL_TERMINAL_INPUT};
    (current & !(LINE_INPUT | ECHO_INPUT)) | VIRTUAL_TERMINAL_INPUT
}

const INPUT_CHUNK: usize = 256;

/// Host standard input as an async byte stream.
///
/// A dedicated thread does the blocking reads. In raw mode the low-level
/// read primitive is used, since the line-oriented one can block forever
/// under some terminal emulators once the mode has been changed.
pub struct HostInput {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    raw: Option<RawModeGuard>,
}

impl HostInput {
    /// Switch stdin to raw mode if it is a terminal and start reading it.
    #[must_use]
    pub fn raw() -> Self {
        let raw = RawModeGuard::enable();
        if raw.is_none() {
            tracing::debug!("stdin is not a terminal, reading it unmodified");
            return Self::plain();
        }
        Self::spawn(raw, read_raw)
    }

    /// Read stdin without touching the terminal mode.
    #[must_use]
    pub fn plain() -> Self {
        Self::from_reader(io::stdin())
    }

    /// Read `reader` on the dedicated input thread.
    ///
    /// The thread is never joined: a read blocked forever does not hold up
    /// runtime shutdown, it only outlives the `HostInput`.
    #[must_use]
    pub fn from_reader<R: io::Read + Send + 'static>(mut reader: R) -> Self {
        Self::spawn(None, move |buf| reader.read(buf))
    }

    /// `true` if the terminal was switched to raw mode.
    #[must_use]
    pub fn is_raw(&self) -> bool {
        self.raw.is_some()
    }

    fn spawn<F>(raw: Option<RawModeGuard>, read: F) -> Self
    where
        F: FnMut(&mut [u8; INPUT_CHUNK]) -> io::Result<usize> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(4);
        let spawned = std::thread::Builder::new()
            .name("vmrunner-stdin".to_owned())
            .spawn(move || read_loop(&tx, read));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start stdin reader");
        }
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
            raw,
        }
    }
}

impl std::fmt::Debug for HostInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostInput")
            .field("raw", &self.is_raw())
            .field("buffered", &(self.pending.len() - self.offset))
            .finish_non_exhaustive()
    }
}

fn read_loop<F>(tx: &mpsc::Sender<io::Result<Vec<u8>>>, mut read: F)
where
    F: FnMut(&mut [u8; INPUT_CHUNK]) -> io::Result<usize>,
{
    let mut buf = [0u8; INPUT_CHUNK];
    loop {
        let message = match read(&mut buf) {
            Ok(0) => return,
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let failed = message.is_err();
        if tx.blocking_send(message).is_err() || failed {
            return;
        }
    }
}

impl AsyncRead for HostInput {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.offset >= this.pending.len() {
            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                // Reader thread gone: end of input.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
            }
        }
        let available = &this.pending[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}
