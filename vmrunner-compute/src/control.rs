//! Control facade over a [`ComputeService`].
//!
//! Turns the service's synchronous / pending / failed call outcomes into a
//! uniform `async` interface. Every operation that can finish asynchronously
//! subscribes to its completion notification before issuing the call, then
//! waits on the subscription only if the call reports pending.

use std::sync::Arc;
use std::time::Duration;

use vmrunner_core::VmId;

use crate::error::{ControlError, Operation};
use crate::service::{CallOutcome, ComputeService, NotificationKind, SystemHandle};
use crate::waiter::{register_wait, Subscription};

/// Delay between terminating a leftover VM and closing its handle.
const CLEANUP_SETTLE: Duration = Duration::from_millis(300);

/// Upper bounds for the asynchronous half of each lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct LifecycleTimeouts {
    /// Wait for create-completed.
    pub create: Duration,
    /// Wait for start-completed. Kernel boot time varies widely.
    pub start: Duration,
    /// Wait for the exit that follows a graceful shutdown request.
    pub shutdown: Duration,
    /// Wait for the exit that follows a terminate request.
    pub terminate: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(60),
            start: Duration::from_secs(120),
            shutdown: Duration::from_secs(30),
            terminate: Duration::from_secs(10),
        }
    }
}

/// Lifecycle operations on compute systems.
///
/// Cheap to clone; clones share the underlying service.
pub struct ControlFacade<S: ComputeService> {
    service: Arc<S>,
    timeouts: LifecycleTimeouts,
}

impl<S: ComputeService> Clone for ControlFacade<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            timeouts: self.timeouts,
        }
    }
}

impl<S: ComputeService> ControlFacade<S> {
    /// Create a facade with the default timeouts.
    #[must_use]
    pub fn new(service: S) -> Self {
        Self::with_timeouts(Arc::new(service), LifecycleTimeouts::default())
    }

    /// Create a facade over a shared service with explicit timeouts.
    #[must_use]
    pub fn with_timeouts(service: Arc<S>, timeouts: LifecycleTimeouts) -> Self {
        Self { service, timeouts }
    }

    /// The underlying service.
    #[must_use]
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Timeouts applied to pending operations.
    #[must_use]
    pub fn timeouts(&self) -> LifecycleTimeouts {
        self.timeouts
    }

    /// Subscribe to `kind` on `system`.
    ///
    /// # Errors
    /// Returns [`ControlError::Register`] if the service rejects the callback.
    pub fn register_wait(
        &self,
        system: &SystemHandle,
        kind: NotificationKind,
        operation: Operation,
    ) -> Result<Subscription<S>, ControlError> {
        register_wait(&self.service, system, kind)
            .map_err(|source| ControlError::Register { operation, source })
    }

    /// Create a compute system and wait for it to exist.
    ///
    /// No handle exists before the call returns, so the create-completed
    /// subscription is taken on the handle returned with the pending outcome.
    /// On a failed or timed-out wait the handle is closed before returning.
    ///
    /// # Errors
    /// - [`ControlError::Call`] if the service rejects the document.
    /// - [`ControlError::Async`] / [`ControlError::Timeout`] if the pending
    ///   create fails or does not finish within the create timeout.
    pub async fn create(&self, id: &VmId, document: &str) -> Result<SystemHandle, ControlError> {
        tracing::info!(vm_id = %id, "creating VM");
        match self.service.create_system(id.as_str(), document) {
            CallOutcome::Completed(system) => Ok(system),
            CallOutcome::Failed(source) => Err(ControlError::Call {
                operation: Operation::Create,
                source,
            }),
            CallOutcome::Pending(system) => {
                tracing::debug!(vm_id = %id, "create pending");
                let waited = match self.register_wait(
                    &system,
                    NotificationKind::SystemCreateCompleted,
                    Operation::Create,
                ) {
                    Ok(mut sub) => {
                        let result = sub.wait(self.timeouts.create).await;
                        sub.release();
                        result.map_err(|e| ControlError::from_wait(Operation::Create, e))
                    }
                    Err(e) => Err(e),
                };
                match waited {
                    Ok(()) => Ok(system),
                    Err(e) => {
                        self.close_quietly(system);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Open an existing compute system.
    ///
    /// Doubles as a liveness probe: failure means no such VM.
    ///
    /// # Errors
    /// Returns [`ControlError::NotFound`] if the system cannot be opened.
    pub fn open(&self, id: &VmId) -> Result<SystemHandle, ControlError> {
        self.service
            .open_system(id.as_str())
            .map_err(|source| ControlError::NotFound {
                id: id.to_string(),
                source,
            })
    }

    /// Start a created system and wait for start-completed.
    ///
    /// # Errors
    /// See [`ControlError`]; a [`ControlError::Timeout`] leaves the handle open.
    pub async fn start(&self, system: &SystemHandle) -> Result<(), ControlError> {
        self.transition(
            system,
            Operation::Start,
            NotificationKind::SystemStartCompleted,
            self.timeouts.start,
            S::start_system,
        )
        .await
    }

    /// Request a graceful shutdown and wait for the system to exit.
    ///
    /// Failure here is normally answered with [`terminate`](Self::terminate).
    ///
    /// # Errors
    /// See [`ControlError`].
    pub async fn shutdown(&self, system: &SystemHandle) -> Result<(), ControlError> {
        self.transition(
            system,
            Operation::Shutdown,
            NotificationKind::SystemExited,
            self.timeouts.shutdown,
            S::shutdown_system,
        )
        .await
    }

    /// Forcibly terminate the system and wait for it to exit.
    ///
    /// # Errors
    /// See [`ControlError`].
    pub async fn terminate(&self, system: &SystemHandle) -> Result<(), ControlError> {
        self.transition(
            system,
            Operation::Terminate,
            NotificationKind::SystemExited,
            self.timeouts.terminate,
            S::terminate_system,
        )
        .await
    }

    /// Release a handle. The VM keeps its current state.
    ///
    /// # Errors
    /// Returns [`ControlError::Call`] if the service fails to release it.
    pub fn close(&self, system: SystemHandle) -> Result<(), ControlError> {
        self.service
            .close_system(system)
            .map_err(|source| ControlError::Call {
                operation: Operation::Close,
                source,
            })
    }

    /// Terminate and close any VM already registered under `id`.
    ///
    /// Best effort: every failure is logged and swallowed.
    pub async fn cleanup_existing(&self, id: &VmId) {
        let Ok(system) = self.open(id) else {
            return;
        };
        tracing::info!(vm_id = %id, "found existing VM, cleaning up");
        if let Err(e) = self.terminate(&system).await {
            tracing::warn!(vm_id = %id, error = %e, "terminate of existing VM failed");
        }
        tokio::time::sleep(CLEANUP_SETTLE).await;
        self.close_quietly(system);
    }

    pub(crate) fn close_quietly(&self, system: SystemHandle) {
        if let Err(e) = self.close(system) {
            tracing::warn!(error = %e, "close handle failed");
        }
    }

    async fn transition(
        &self,
        system: &SystemHandle,
        operation: Operation,
        kind: NotificationKind,
        timeout: Duration,
        call: fn(&S, &SystemHandle) -> CallOutcome<()>,
    ) -> Result<(), ControlError> {
        let mut sub = self.register_wait(system, kind, operation)?;

        let result = match call(&self.service, system) {
            CallOutcome::Completed(()) => Ok(()),
            CallOutcome::Failed(source) => Err(ControlError::Call { operation, source }),
            CallOutcome::Pending(()) => {
                tracing::debug!(%operation, timeout_ms = timeout.as_millis(), "operation pending");
                sub.wait(timeout)
                    .await
                    .map_err(|e| ControlError::from_wait(operation, e))
            }
        };

        sub.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::service::CallOutcome;
    use crate::testing::{Behavior, Op, ScriptedService};

    fn facade(service: ScriptedService) -> ControlFacade<ScriptedService> {
        ControlFacade::new(service)
    }

    fn vm_id() -> VmId {
        VmId::new("test-vm").unwrap_or_else(|e| panic!("{e}"))
    }

    #[tokio::test(start_paused = true)]
    async fn create_completed_returns_handle_without_waiting() {
        let facade = facade(ScriptedService::new());
        let system = match facade.create(&vm_id(), "{}").await {
            Ok(s) => s,
            Err(e) => panic!("create failed: {e}"),
        };
        assert_eq!(facade.service().registered_callbacks(), 0);
        assert!(facade.close(system).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn create_pending_waits_for_completion() {
        let service = ScriptedService::new();
        service.script(Op::Create, Behavior::PendingFires(0));
        let facade = facade(service);

        let result = facade.create(&vm_id(), "{}").await;
        assert!(result.is_ok(), "pending create must resolve: {result:?}");
        assert_eq!(facade.service().count(Op::Close), 0, "successful create keeps its handle");
        assert_eq!(facade.service().registered_callbacks(), 0, "subscription must be released");
    }

    #[tokio::test(start_paused = true)]
    async fn create_pending_timeout_closes_handle() {
        let service = ScriptedService::new();
        service.script(Op::Create, Behavior::PendingSilent);
        let facade = facade(service);

        let started = tokio::time::Instant::now();
        let result = facade.create(&vm_id(), "{}").await;
        assert!(matches!(result, Err(ref e) if e.is_timeout()), "got {result:?}");
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(facade.service().count(Op::Close), 1, "timed-out create must close its handle");
    }

    #[tokio::test(start_paused = true)]
    async fn create_pending_failure_is_wrapped_and_closes() {
        let service = ScriptedService::new();
        service.script(Op::Create, Behavior::PendingFires(-5));
        let facade = facade(service);

        let err = match facade.create(&vm_id(), "{}").await {
            Err(e) => e,
            Ok(_) => panic!("failed create must not succeed"),
        };
        assert!(matches!(err, ControlError::Async { operation: Operation::Create, .. }));
        assert!(err.to_string().starts_with("wait for create"));
        assert_eq!(facade.service().count(Op::Close), 1);
    }

    #[tokio::test]
    async fn create_failure_propagates_detail_and_closes_nothing() {
        let service = ScriptedService::new();
        service.script(Op::Create, Behavior::Fail(0xC037_010F));
        let facade = facade(service);

        let err = match facade.create(&vm_id(), "{}").await {
            Err(e) => e,
            Ok(_) => panic!("failed create must not succeed"),
        };
        let text = err.to_string();
        assert!(text.contains("0xC037010F"), "code missing from {text}");
        assert!(text.contains("create test-vm refused"), "detail missing from {text}");
        assert_eq!(facade.service().count(Op::Close), 0);
    }

    #[test]
    fn open_missing_vm_is_not_found() {
        let facade = facade(ScriptedService::new());
        assert!(matches!(facade.open(&vm_id()), Err(ControlError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn start_catches_completion_fired_during_the_call() {
        let service = ScriptedService::new();
        service.script(Op::Start, Behavior::PendingFires(0));
        let facade = facade(service);
        let system = facade.service().fresh_handle();

        let started = tokio::time::Instant::now();
        let result = facade.start(&system).await;
        assert!(result.is_ok(), "pre-registered wait must see the early completion");
        assert!(started.elapsed() < Duration::from_secs(1), "must not wait for the timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn start_pending_times_out_after_start_ceiling() {
        let service = ScriptedService::new();
        service.script(Op::Start, Behavior::PendingSilent);
        let facade = facade(service);
        let system = facade.service().fresh_handle();

        let started = tokio::time::Instant::now();
        let err = match facade.start(&system).await {
            Err(e) => e,
            Ok(()) => panic!("silent start must time out"),
        };
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert_eq!(facade.service().registered_callbacks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_uses_its_own_ceiling() {
        let service = ScriptedService::new();
        service.script(Op::Terminate, Behavior::PendingSilent);
        let facade = facade(service);
        let system = facade.service().fresh_handle();

        let started = tokio::time::Instant::now();
        assert!(facade.terminate(&system).await.is_err());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn immediate_failure_is_call_error() {
        let service = ScriptedService::new();
        service.script(Op::Shutdown, Behavior::Fail(0x8037_0105));
        let facade = facade(service);
        let system = facade.service().fresh_handle();

        assert!(matches!(
            facade.shutdown(&system).await,
            Err(ControlError::Call { operation: Operation::Shutdown, .. })
        ));
        assert_eq!(facade.service().registered_callbacks(), 0);
    }

    #[tokio::test]
    async fn registration_failure_is_fatal_before_the_call() {
        let service = ScriptedService::new();
        service.fail_registration(0x8007_000E);
        let facade = facade(service);
        let system = facade.service().fresh_handle();

        assert!(matches!(
            facade.start(&system).await,
            Err(ControlError::Register { operation: Operation::Start, .. })
        ));
        assert_eq!(facade.service().count(Op::Start), 0, "start must not be issued");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_existing_terminates_and_closes() {
        let service = ScriptedService::new();
        service.add_existing("test-vm");
        let facade = facade(service);

        facade.cleanup_existing(&vm_id()).await;
        assert_eq!(facade.service().calls(), vec![Op::Open, Op::Terminate, Op::Close]);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_existing_swallows_all_errors() {
        let service = ScriptedService::new();
        service.add_existing("test-vm");
        service.script(Op::Terminate, Behavior::Fail(0x8000_4005));
        let facade = facade(service);

        facade.cleanup_existing(&vm_id()).await;
        assert_eq!(facade.service().count(Op::Close), 1, "handle must still be closed");
    }

    #[tokio::test]
    async fn cleanup_of_missing_vm_is_a_no_op() {
        let facade = facade(ScriptedService::new());
        facade.cleanup_existing(&vm_id()).await;
        assert_eq!(facade.service().calls(), vec![Op::Open]);
    }

    #[test]
    fn pending_outcome_carries_usable_handle() {
        let service = Arc::new(ScriptedService::new());
        service.script(Op::Create, Behavior::PendingSilent);
        let CallOutcome::Pending(system) = service.create_system("x", "{}") else {
            panic!("expected pending");
        };
        assert_ne!(system.as_raw(), 0, "pending handle must be non-null");
        let sub = register_wait(&service, &system, NotificationKind::SystemCreateCompleted);
        assert!(sub.is_ok(), "pending handle must accept a subscription");
    }
}
