//! Console mode switching for Windows consoles.

use std::io;

use windows::Win32::Storage::FileSystem::ReadFile;
use windows::Win32::System::Console::{
    GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE, STD_INPUT_HANDLE,
};

use super::{raw_input_mode, INPUT_CHUNK};

/// Restores the saved console input mode on drop.
pub struct RawModeGuard {
    original: u32,
}

impl RawModeGuard {
    /// Switch the stdin console to raw virtual-terminal input.
    ///
    /// Returns `None` when stdin is not a console (redirected or piped).
    #[must_use]
    pub fn enable() -> Option<Self> {
        // SAFETY: plain console API calls on the process's own stdin handle.
        unsafe {
            let handle = GetStdHandle(STD_INPUT_HANDLE).ok()?;
            let mut mode = CONSOLE_MODE::default();
            GetConsoleMode(handle, &mut mode).ok()?;
            SetConsoleMode(handle, CONSOLE_MODE(raw_input_mode(mode.0))).ok()?;
            Some(Self { original: mode.0 })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: as in `enable`.
        unsafe {
            if let Ok(handle) = GetStdHandle(STD_INPUT_HANDLE) {
                let _ = SetConsoleMode(handle, CONSOLE_MODE(self.original));
            }
        }
    }
}

/// Read the console with `ReadFile` rather than `ReadConsole`.
pub(super) fn read_raw(buf: &mut [u8; INPUT_CHUNK]) -> io::Result<usize> {
    let mut read = 0u32;
    // SAFETY: `buf` and `read` outlive the synchronous call.
    unsafe {
        let handle = GetStdHandle(STD_INPUT_HANDLE)?;
        ReadFile(handle, Some(buf.as_mut_slice()), Some(std::ptr::addr_of_mut!(read)), None)?;
    }
    Ok(read as usize)
}
