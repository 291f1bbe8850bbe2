//! Error types for the compute crate.

use std::fmt;
use std::time::Duration;

use vmrunner_core::CoreError;

use crate::service::{CallFailure, NotificationKind};

/// Lifecycle operation an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Operation {
    Create,
    Open,
    Start,
    Shutdown,
    Terminate,
    Close,
    CreateProcess,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Open => "open",
            Self::Start => "start",
            Self::Shutdown => "shutdown",
            Self::Terminate => "terminate",
            Self::Close => "close",
            Self::CreateProcess => "create process",
        };
        f.write_str(name)
    }
}

/// Why a [`Subscription`](crate::waiter::Subscription) wait ended without success.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WaitError {
    /// The awaited notification arrived carrying a failure status.
    #[error("{0}")]
    Failed(CallFailure),

    /// The deadline elapsed before the notification arrived.
    #[error("timeout after {timeout:?} waiting for notification {kind}")]
    TimedOut { kind: NotificationKind, timeout: Duration },

    /// The subscription was released before anything arrived.
    #[error("subscription for {kind} released before delivery")]
    Released { kind: NotificationKind },
}

/// Errors surfaced by the control facade and the VM record.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The call failed synchronously.
    #[error("{operation}: {source}")]
    Call {
        operation: Operation,
        #[source]
        source: CallFailure,
    },

    /// The call was accepted but its completion notification reported failure.
    #[error("wait for {operation}: {source}")]
    Async {
        operation: Operation,
        #[source]
        source: CallFailure,
    },

    /// The completion notification did not arrive in time.
    #[error("wait for {operation}: timeout after {timeout:?} waiting for notification {kind}")]
    Timeout {
        operation: Operation,
        kind: NotificationKind,
        timeout: Duration,
    },

    /// The subscription ended without the notification being delivered.
    #[error("wait for {operation}: notification {kind} was never delivered")]
    Undelivered { operation: Operation, kind: NotificationKind },

    /// The completion callback could not be registered.
    #[error("register completion callback for {operation}: {source}")]
    Register {
        operation: Operation,
        #[source]
        source: CallFailure,
    },

    /// No compute system with the given ID could be opened.
    #[error("VM {id:?} not found: {source}")]
    NotFound {
        id: String,
        #[source]
        source: CallFailure,
    },

    /// The VM configuration could not be turned into a document.
    #[error("build config: {0}")]
    Config(#[from] CoreError),

    /// Process parameters could not be encoded.
    #[error("encode process parameters: {0}")]
    Encode(#[from] serde_json::Error),

    /// Copying a guest process stream failed.
    #[error("guest process I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// `true` if the error is a wait timeout, which callers may recover from.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn from_wait(operation: Operation, err: WaitError) -> Self {
        match err {
            WaitError::Failed(source) => Self::Async { operation, source },
            WaitError::TimedOut { kind, timeout } => Self::Timeout { operation, kind, timeout },
            WaitError::Released { kind } => Self::Undelivered { operation, kind },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_recoverable_kind() {
        let err = ControlError::from_wait(
            Operation::Shutdown,
            WaitError::TimedOut {
                kind: NotificationKind::SystemExited,
                timeout: Duration::from_secs(30),
            },
        );
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("wait for shutdown: timeout after 30s"));
    }

    #[test]
    fn async_failure_is_not_timeout() {
        let err = ControlError::from_wait(
            Operation::Start,
            WaitError::Failed(CallFailure::new(0x8037_0110, None)),
        );
        assert!(!err.is_timeout());
        assert!(matches!(err, ControlError::Async { operation: Operation::Start, .. }));
    }

    #[test]
    fn call_error_display_names_operation() {
        let err = ControlError::Call {
            operation: Operation::Create,
            source: CallFailure {
                code: 0xC037_010E,
                system_message: None,
                detail: Some("already exists".to_owned()),
            },
        };
        assert_eq!(err.to_string(), "create: HRESULT 0xC037010E: already exists");
    }
}
