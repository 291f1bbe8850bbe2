//! Shell-prompt detection on the guest console stream.
//!
//! There is no framing on a serial console, so a one-shot command is
//! considered finished when the guest shell prints its next prompt. The
//! prompt is recognised heuristically: a `#` or `$` directly next to a space,
//! on either side (`" #"`, `" $"`, `"# "`, `"$ "`).
//!
//! Accepting the trailing-space forms catches `root@host:/# ` and `$ `
//! prompts that have no space before the marker, at the price of more false
//! positives: a `# comment` line, as printed by `cat /etc/fstab` or most
//! shell scripts, ends the scan at its second byte and the rest of the
//! output is lost to the next scan. Customised prompts without any such
//! pair are never seen.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ConsoleError;

/// Result of scanning a stream for a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// A prompt was seen.
    Prompt,
    /// The stream ended first.
    Closed,
}

/// Byte-at-a-time prompt recogniser.
#[derive(Debug, Default, Clone)]
pub struct PromptScanner {
    prev: Option<u8>,
}

impl PromptScanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns `true` when it completes a prompt.
    ///
    /// The scanner resets after a match.
    pub fn push(&mut self, byte: u8) -> bool {
        let matched = match (self.prev, byte) {
            (Some(b' '), b'#' | b'$') | (Some(b'#' | b'$'), b' ') => true,
            _ => false,
        };
        self.prev = if matched { None } else { Some(byte) };
        matched
    }
}

/// Copy `reader` to `sink` one byte at a time until a prompt or end of stream.
///
/// Every byte consumed, including the prompt itself, is written to `sink`
/// and, when given, appended to `capture`.
///
/// # Errors
/// [`ConsoleError::Channel`] on read failure, [`ConsoleError::Host`] when
/// `sink` fails.
pub async fn scan_until_prompt<R, W>(
    reader: &mut R,
    sink: &mut W,
    mut capture: Option<&mut Vec<u8>>,
) -> Result<Scan, ConsoleError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut scanner = PromptScanner::new();
    let mut byte = [0u8; 1];
    loop {
        let n = match reader.read(&mut byte).await {
            Ok(n) => n,
            Err(e) if crate::transport::is_peer_closed(&e) => 0,
            Err(e) => return Err(ConsoleError::Channel(e)),
        };
        if n == 0 {
            sink.flush().await.map_err(ConsoleError::Host)?;
            return Ok(Scan::Closed);
        }
        sink.write_all(&byte).await.map_err(ConsoleError::Host)?;
        if let Some(buf) = capture.as_deref_mut() {
            buf.push(byte[0]);
        }
        if scanner.push(byte[0]) {
            sink.flush().await.map_err(ConsoleError::Host)?;
            return Ok(Scan::Prompt);
        }
    }
}

/// Wait for the guest shell to show a prompt, echoing everything to `echo`.
///
/// # Errors
/// [`ConsoleError::ClosedBeforePrompt`] if the stream ends first, or any
/// I/O error from [`scan_until_prompt`].
pub async fn wait_for_prompt<R, W>(reader: &mut R, echo: &mut W) -> Result<(), ConsoleError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    match scan_until_prompt(reader, echo, None).await? {
        Scan::Prompt => Ok(()),
        Scan::Closed => Err(ConsoleError::ClosedBeforePrompt),
    }
}

/// Forward command output to `sink` until the next prompt, returning
/// everything read.
///
/// # Errors
/// As [`wait_for_prompt`].
pub async fn collect_until_prompt<R, W>(reader: &mut R, sink: &mut W) -> Result<Vec<u8>, ConsoleError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut captured = Vec::new();
    match scan_until_prompt(reader, sink, Some(&mut captured)).await? {
        Scan::Prompt => Ok(captured),
        Scan::Closed => Err(ConsoleError::ClosedBeforePrompt),
    }
}
