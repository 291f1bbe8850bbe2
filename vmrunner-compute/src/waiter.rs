//! Completion waiter: one-shot subscriptions to system notifications.
//!
//! The service reports asynchronous completion only through a callback that
//! runs on one of its own threads, possibly while the triggering call is still
//! returning. A [`Subscription`] therefore has to exist before the call is
//! issued; a notification delivered to nobody is lost.
//!
//! Delivery is a single-slot handoff: the callback `try_send`s into a channel
//! of capacity one and drops anything that does not fit. Only the first
//! notification of the subscribed kind matters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::WaitError;
use crate::service::{
    CallFailure, CallbackToken, ComputeService, Notification, NotificationCallback,
    NotificationKind, SystemHandle,
};

/// A registered interest in one notification kind on one system.
///
/// Released on drop; [`release`](Self::release) may also be called
/// explicitly and is idempotent.
pub struct Subscription<S: ComputeService> {
    service: Arc<S>,
    kind: NotificationKind,
    token: Option<CallbackToken>,
    rx: mpsc::Receiver<Result<(), CallFailure>>,
}

/// Register a one-shot wait for `kind` on `system`.
///
/// Must be called before the operation that may produce the notification.
///
/// # Errors
/// Propagates the service's refusal to register the callback.
pub fn register_wait<S: ComputeService>(
    service: &Arc<S>,
    system: &SystemHandle,
    kind: NotificationKind,
) -> Result<Subscription<S>, CallFailure> {
    let (tx, rx) = mpsc::channel(1);

    let callback: NotificationCallback = Box::new(move |notification: Notification| {
        if notification.kind != kind {
            return;
        }
        // Full or closed: an earlier delivery already won, or nobody waits.
        let _ = tx.try_send(notification.into_result());
    });

    let token = service.register_callback(system, callback)?;
    tracing::trace!(system = system.as_raw(), %kind, "registered completion callback");

    Ok(Subscription {
        service: Arc::clone(service),
        kind,
        token: Some(token),
        rx,
    })
}

impl<S: ComputeService> Subscription<S> {
    /// Wait until the subscribed notification arrives or `timeout` elapses.
    ///
    /// Suspends only the calling task.
    ///
    /// # Errors
    /// - [`WaitError::Failed`] if the notification carries a failure status.
    /// - [`WaitError::TimedOut`] if nothing arrived in time.
    /// - [`WaitError::Released`] if the subscription was released first.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), WaitError> {
        let kind = self.kind;
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(result)) => result.map_err(WaitError::Failed),
            Ok(None) => Err(WaitError::Released { kind }),
            Err(_) => Err(WaitError::TimedOut { kind, timeout }),
        }
    }

    /// Unregister the callback. Safe to call any number of times.
    pub fn release(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        if let Err(e) = self.service.unregister_callback(token) {
            tracing::warn!(kind = %self.kind, error = %e, "unregister completion callback failed");
        }
        // Anything still in flight can no longer be observed.
        self.rx.close();
    }
}

impl<S: ComputeService> Drop for Subscription<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: ComputeService> std::fmt::Debug for Subscription<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("registered", &self.token.is_some())
            .finish_non_exhaustive()
    }
}
