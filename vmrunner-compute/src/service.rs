//! Host Compute Service contract.
//!
//! [`ComputeService`] is the seam between the lifecycle logic and the
//! platform binding. Every lifecycle call reports a [`CallOutcome`]: it either
//! completed, failed, or was accepted and will complete later. A pending call
//! has already produced a valid handle; completion is only observable through
//! a notification callback registered on that handle.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

/// Raw value of a service-owned handle.
pub type RawHandle = usize;

/// Byte source handed across the service boundary.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink handed across the service boundary.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback invoked by the service for every notification on a system.
///
/// The service may invoke it from any thread, concurrently with the call that
/// triggered the notification.
pub type NotificationCallback = Box<dyn Fn(Notification) + Send + Sync + 'static>;

/// Opaque reference to a compute system.
///
/// Not `Clone`: each handle instance is released exactly once through
/// [`ComputeService::close_system`]. Dropping it does NOT release it.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "a system handle must be closed exactly once"]
pub struct SystemHandle(RawHandle);

impl SystemHandle {
    /// Wrap a raw handle returned by the service.
    pub fn from_raw(raw: RawHandle) -> Self {
        Self(raw)
    }

    /// Raw handle value, for passing back to the service.
    #[must_use]
    pub fn as_raw(&self) -> RawHandle {
        self.0
    }
}

/// Opaque reference to a process running inside a compute system.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "a process handle must be closed"]
pub struct ProcessHandle(RawHandle);

impl ProcessHandle {
    /// Wrap a raw handle returned by the service.
    pub fn from_raw(raw: RawHandle) -> Self {
        Self(raw)
    }

    /// Raw handle value, for passing back to the service.
    #[must_use]
    pub fn as_raw(&self) -> RawHandle {
        self.0
    }
}

/// Registration of a notification callback, returned by
/// [`ComputeService::register_callback`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct CallbackToken(RawHandle);

impl CallbackToken {
    /// Wrap a raw registration handle.
    #[must_use]
    pub fn from_raw(raw: RawHandle) -> Self {
        Self(raw)
    }

    /// Raw registration handle value.
    #[must_use]
    pub fn as_raw(&self) -> RawHandle {
        self.0
    }
}

/// Kind of a system notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// The system stopped, gracefully or not.
    SystemExited,
    /// An asynchronous create finished.
    SystemCreateCompleted,
    /// An asynchronous start finished.
    SystemStartCompleted,
    /// Any other notification; ignored by this crate.
    Other(u32),
}

impl NotificationKind {
    /// Decode the wire value of a notification type.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x1 => Self::SystemExited,
            0x2 => Self::SystemCreateCompleted,
            0x3 => Self::SystemStartCompleted,
            other => Self::Other(other),
        }
    }

    /// Wire value of this notification type.
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            Self::SystemExited => 0x1,
            Self::SystemCreateCompleted => 0x2,
            Self::SystemStartCompleted => 0x3,
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemExited => f.write_str("system-exited"),
            Self::SystemCreateCompleted => f.write_str("create-completed"),
            Self::SystemStartCompleted => f.write_str("start-completed"),
            Self::Other(raw) => write!(f, "0x{raw:X}"),
        }
    }
}

/// A notification delivered through a registered callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// What happened.
    pub kind: NotificationKind,
    /// HRESULT of the completed operation; negative means failure.
    pub status: i32,
    /// Free-form text attached by the service, if any.
    pub data: Option<String>,
}

impl Notification {
    /// Interpret the notification status.
    ///
    /// # Errors
    /// Returns the failure carried by the notification when `status` is
    /// negative.
    pub fn into_result(self) -> Result<(), CallFailure> {
        if self.status < 0 {
            #[allow(clippy::cast_sign_loss)]
            let code = self.status as u32;
            Err(CallFailure::new(code, self.data))
        } else {
            Ok(())
        }
    }
}

/// Result of a lifecycle call.
#[derive(Debug)]
#[must_use]
pub enum CallOutcome<T> {
    /// The call finished synchronously and succeeded.
    Completed(T),
    /// The call was accepted and finishes asynchronously. The value (usually a
    /// handle) is already valid.
    Pending(T),
    /// The call failed synchronously.
    Failed(CallFailure),
}

/// A failed call: HRESULT plus whatever text the service attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    /// HRESULT bits.
    pub code: u32,
    /// System description of `code`, when the platform has one.
    pub system_message: Option<String>,
    /// Result document or detail text returned by the service.
    pub detail: Option<String>,
}

impl CallFailure {
    /// Build a failure for `code`, looking up the platform description.
    #[must_use]
    pub fn new(code: u32, detail: Option<String>) -> Self {
        Self {
            code,
            system_message: system_message(code),
            detail: detail.filter(|d| !d.is_empty()),
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HRESULT 0x{:08X}", self.code)?;
        if let Some(msg) = &self.system_message {
            write!(f, " ({msg})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CallFailure {}

#[cfg(windows)]
fn system_message(code: u32) -> Option<String> {
    #[allow(clippy::cast_possible_wrap)]
    let message = windows::core::HRESULT(code as i32).message();
    let message = message.trim_end();
    (!message.is_empty()).then(|| message.to_owned())
}

#[cfg(not(windows))]
fn system_message(_code: u32) -> Option<String> {
    None
}

/// A process created inside a compute system.
pub struct GuestProcess {
    /// Handle to close once the process is no longer needed.
    pub handle: ProcessHandle,
    /// Guest process identifier.
    pub process_id: u32,
    /// Standard streams, when the agent channel provides them.
    pub io: ProcessIo,
}

impl fmt::Debug for GuestProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestProcess")
            .field("handle", &self.handle)
            .field("process_id", &self.process_id)
            .field("io_absent", &self.io.is_absent())
            .finish()
    }
}

/// Standard streams of a guest process.
#[derive(Default)]
pub struct ProcessIo {
    /// Guest standard input.
    pub stdin: Option<BoxedWriter>,
    /// Guest standard output.
    pub stdout: Option<BoxedReader>,
    /// Guest standard error.
    pub stderr: Option<BoxedReader>,
}

impl ProcessIo {
    /// `true` when the service returned no stream at all, which means the
    /// in-guest agent channel cannot serve this command.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

/// Operations exposed by the Host Compute Service.
///
/// Implementations must be `Send + Sync`; notification callbacks are invoked
/// from service-owned threads.
pub trait ComputeService: Send + Sync + 'static {
    /// Create a compute system from a configuration document.
    fn create_system(&self, id: &str, configuration: &str) -> CallOutcome<SystemHandle>;

    /// Open an existing compute system by ID. Never pending.
    ///
    /// # Errors
    /// Fails when no system with `id` exists or it cannot be opened.
    fn open_system(&self, id: &str) -> Result<SystemHandle, CallFailure>;

    /// Start a created system.
    fn start_system(&self, system: &SystemHandle) -> CallOutcome<()>;

    /// Request a graceful shutdown.
    fn shutdown_system(&self, system: &SystemHandle) -> CallOutcome<()>;

    /// Forcibly terminate the system.
    fn terminate_system(&self, system: &SystemHandle) -> CallOutcome<()>;

    /// Release a handle without changing the system's state.
    ///
    /// # Errors
    /// Propagates the service's failure to release the handle.
    fn close_system(&self, system: SystemHandle) -> Result<(), CallFailure>;

    /// Register `callback` for every notification on `system`.
    ///
    /// # Errors
    /// Fails when the service rejects the registration.
    fn register_callback(
        &self,
        system: &SystemHandle,
        callback: NotificationCallback,
    ) -> Result<CallbackToken, CallFailure>;

    /// Remove a registration. No callback runs after this returns.
    ///
    /// # Errors
    /// Propagates the service's failure to unregister.
    fn unregister_callback(&self, token: CallbackToken) -> Result<(), CallFailure>;

    /// Create a process inside the system through the in-guest agent.
    fn create_process(&self, system: &SystemHandle, parameters: &str) -> CallOutcome<GuestProcess>;

    /// Release a process handle.
    ///
    /// # Errors
    /// Propagates the service's failure to release the handle.
    fn close_process(&self, process: ProcessHandle) -> Result<(), CallFailure>;
}
