//! Host Compute Service lifecycle control for vmrunner.
//!
//! Wraps a compute service whose calls complete synchronously, fail, or
//! report pending into a uniform async interface with race-free completion
//! waits, and layers the VM record and the in-guest process adapter on top.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod control;
pub mod error;
pub mod process;
pub mod service;
pub mod vm;
pub mod waiter;

#[cfg(windows)]
pub mod vmcompute;

#[cfg(test)]
mod testing;

pub use control::{ControlFacade, LifecycleTimeouts};
pub use error::{ControlError, Operation, WaitError};
pub use process::{run_in_guest, GuestRun, HostStdio, ProcessParameters};
pub use service::{
    CallFailure, CallOutcome, ComputeService, GuestProcess, Notification, NotificationKind,
    ProcessIo, SystemHandle,
};
pub use vm::{kill, probe, stop, Vm};
pub use waiter::{register_wait, Subscription};

#[cfg(windows)]
pub use vmcompute::VmComputeService;
