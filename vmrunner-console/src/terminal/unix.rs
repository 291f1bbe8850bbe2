//! termios raw mode for Unix terminals.

use std::io;

use super::INPUT_CHUNK;

/// Restores the saved terminal settings of stdin on drop.
pub struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// Disable canonical mode and echo on stdin, keeping signal keys.
    ///
    /// Returns `None` if stdin is not a TTY or its settings cannot be changed.
    #[must_use]
    pub fn enable() -> Option<Self> {
        let fd = libc::STDIN_FILENO;
        // SAFETY: isatty only inspects the descriptor.
        if unsafe { libc::isatty(fd) } != 1 {
            return None;
        }

        // SAFETY: termios is plain data; tcgetattr fills it.
        let mut original: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut original) } != 0 {
            return None;
        }

        let mut raw = original;
        // ISIG stays set so Ctrl+C still interrupts.
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;

        // SAFETY: `raw` is a valid termios derived from the current one.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return None;
        }
        Some(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: restoring settings previously read from the same descriptor.
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// Read stdin with `read(2)`, bypassing the standard library's buffer.
pub(super) fn read_raw(buf: &mut [u8; INPUT_CHUNK]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for writes of its full length.
    let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
    usize::try_from(n).map_err(|_| io::Error::last_os_error())
}
