//! VM record: one running compute system owned by this process.

use std::time::Duration;

use chrono::{DateTime, Utc};
use vmrunner_core::{VmConfig, VmId};

use crate::control::ControlFacade;
use crate::error::ControlError;
use crate::service::{ComputeService, SystemHandle};

/// Delay between a successful stop and closing the handle.
const SHUTDOWN_SETTLE: Duration = Duration::from_millis(500);

/// A started VM and the handle that owns it.
///
/// Dropping a `Vm` leaks its handle. Call [`shutdown`](Self::shutdown) or
/// [`detach`](Self::detach) explicitly.
#[must_use = "a VM must be shut down or detached"]
pub struct Vm<S: ComputeService> {
    id: VmId,
    system: SystemHandle,
    facade: ControlFacade<S>,
    pipe_name: String,
    started_at: DateTime<Utc>,
}

impl<S: ComputeService> Vm<S> {
    /// Create and start a VM from `config`.
    ///
    /// A leftover VM with the same ID is terminated first. If start fails the
    /// new handle is closed before the error is returned.
    ///
    /// # Errors
    /// - [`ControlError::Config`] if the configuration document is invalid.
    /// - Any create or start failure from the facade.
    pub async fn start(facade: &ControlFacade<S>, config: &VmConfig) -> Result<Self, ControlError> {
        let id = config.vm_id.clone();
        facade.cleanup_existing(&id).await;

        let document = config.to_document()?;
        tracing::debug!(vm_id = %id, %document, "rendered VM document");

        let system = facade.create(&id, &document).await?;
        tracing::info!(vm_id = %id, "VM created, starting");

        if let Err(e) = facade.start(&system).await {
            facade.close_quietly(system);
            return Err(e);
        }

        let pipe_name = config.console_pipe_name();
        tracing::info!(vm_id = %id, pipe = %pipe_name, "VM started");

        Ok(Self {
            id,
            system,
            facade: facade.clone(),
            pipe_name,
            started_at: Utc::now(),
        })
    }

    /// VM identifier.
    #[must_use]
    pub fn id(&self) -> &VmId {
        &self.id
    }

    /// Console pipe bound to COM port 0.
    #[must_use]
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// When the start completed.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Handle to the running system.
    #[must_use]
    pub fn system(&self) -> &SystemHandle {
        &self.system
    }

    /// Shut the VM down and release its handle.
    ///
    /// Graceful shutdown first; on any failure, terminate once. The handle is
    /// closed exactly once whatever happens.
    ///
    /// # Errors
    /// Returns the terminate error when both shutdown and terminate fail.
    /// The handle is closed in that case too.
    pub async fn shutdown(self) -> Result<(), ControlError> {
        let Self { id, system, facade, .. } = self;
        tracing::info!(vm_id = %id, "shutting down VM");

        let result = match facade.shutdown(&system).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(vm_id = %id, error = %e, "graceful shutdown failed, terminating");
                facade.terminate(&system).await
            }
        };

        if result.is_ok() {
            tokio::time::sleep(SHUTDOWN_SETTLE).await;
        }
        facade.close_quietly(system);
        result
    }

    /// Release the handle and leave the VM running.
    ///
    /// # Errors
    /// Returns [`ControlError::Call`] if the handle cannot be closed.
    pub fn detach(self) -> Result<(), ControlError> {
        tracing::info!(vm_id = %self.id, pipe = %self.pipe_name, "detaching, VM left running");
        self.facade.close(self.system)
    }
}

impl<S: ComputeService> std::fmt::Debug for Vm<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("system", &self.system)
            .field("pipe_name", &self.pipe_name)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Gracefully stop a VM this process does not own. No terminate fallback.
///
/// # Errors
/// [`ControlError::NotFound`] if no such VM exists, or the shutdown error.
pub async fn stop<S: ComputeService>(facade: &ControlFacade<S>, id: &VmId) -> Result<(), ControlError> {
    let system = facade.open(id)?;
    tracing::info!(vm_id = %id, "stopping VM");
    let result = facade.shutdown(&system).await;
    if result.is_ok() {
        tokio::time::sleep(SHUTDOWN_SETTLE).await;
    }
    facade.close_quietly(system);
    result
}

/// Forcibly terminate a VM this process does not own.
///
/// # Errors
/// [`ControlError::NotFound`] if no such VM exists, or the terminate error.
pub async fn kill<S: ComputeService>(facade: &ControlFacade<S>, id: &VmId) -> Result<(), ControlError> {
    let system = facade.open(id)?;
    tracing::info!(vm_id = %id, "terminating VM");
    let result = facade.terminate(&system).await;
    facade.close_quietly(system);
    result
}

/// Check that `id` names an existing VM and return its console pipe name.
///
/// # Errors
/// [`ControlError::NotFound`] if the VM cannot be opened.
pub fn probe<S: ComputeService>(facade: &ControlFacade<S>, id: &VmId) -> Result<String, ControlError> {
    let system = facade.open(id)?;
    facade.close_quietly(system);
    Ok(id.console_pipe_name())
}
