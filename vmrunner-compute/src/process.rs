//! In-guest process adapter.
//!
//! Runs a command through the in-guest agent channel when the service can
//! hand back the process's standard streams. When it cannot, the caller gets
//! [`GuestRun::Unsupported`] and falls back to the serial console.

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use vmrunner_core::shell_join;

use crate::control::ControlFacade;
use crate::error::{ControlError, Operation};
use crate::service::{BoxedReader, BoxedWriter, CallOutcome, ComputeService, SystemHandle};

/// Command used when none is given.
pub const DEFAULT_GUEST_COMMAND: &str = "/bin/sh";

/// Parameters document for creating a guest process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessParameters {
    pub application_name: String,
    pub command_line: String,
    pub working_directory: String,
    pub create_std_in_pipe: bool,
    pub create_std_out_pipe: bool,
    pub create_std_err_pipe: bool,
    pub emulate_console: bool,
}

impl ProcessParameters {
    /// Parameters for running `args` from `/` with all three pipes.
    ///
    /// An empty `args` runs [`DEFAULT_GUEST_COMMAND`].
    #[must_use]
    pub fn for_command<S: AsRef<str>>(args: &[S]) -> Self {
        let (application_name, command_line) = match args.first() {
            Some(first) => (first.as_ref().to_owned(), shell_join(args)),
            None => (DEFAULT_GUEST_COMMAND.to_owned(), DEFAULT_GUEST_COMMAND.to_owned()),
        };
        Self {
            application_name,
            command_line,
            working_directory: "/".to_owned(),
            create_std_in_pipe: true,
            create_std_out_pipe: true,
            create_std_err_pipe: true,
            emulate_console: false,
        }
    }
}

/// Outcome of [`run_in_guest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestRun {
    /// The agent channel returned no streams; use the serial console instead.
    Unsupported,
    /// The command ran and its output stream closed.
    Completed {
        /// Guest process identifier.
        process_id: u32,
        /// Reported exit code. The agent channel does not surface one, so a
        /// process whose output closed cleanly reports `0`.
        exit_code: i32,
    },
}

/// Host-side streams wired to a guest process.
pub struct HostStdio {
    pub input: BoxedReader,
    pub output: BoxedWriter,
    pub error: BoxedWriter,
}

impl HostStdio {
    /// Guest input from `input`, guest output and errors to this process's
    /// stdout and stderr.
    ///
    /// `input` is abandoned, not drained, once guest stdout closes, so it
    /// must not be a source whose pending read blocks runtime shutdown.
    #[must_use]
    pub fn with_input(input: BoxedReader) -> Self {
        Self {
            input,
            output: Box::new(tokio::io::stdout()),
            error: Box::new(tokio::io::stderr()),
        }
    }
}

impl std::fmt::Debug for HostStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStdio").finish_non_exhaustive()
    }
}

/// Run `args` inside `system` through the in-guest agent.
///
/// A pending create is treated as started: no completion is awaited. Host
/// input feeds guest stdin and guest stderr feeds host error in the
/// background; the call returns once guest stdout closes.
///
/// # Errors
/// - [`ControlError::Encode`] if the parameters cannot be serialised.
/// - [`ControlError::Call`] if the service rejects the process.
/// - [`ControlError::Io`] if copying guest stdout to the host fails.
pub async fn run_in_guest<S: ComputeService, A: AsRef<str>>(
    facade: &ControlFacade<S>,
    system: &SystemHandle,
    args: &[A],
    stdio: HostStdio,
) -> Result<GuestRun, ControlError> {
    let params = ProcessParameters::for_command(args);
    let document = serde_json::to_string(&params)?;
    tracing::info!(command = %params.command_line, "creating guest process");

    let service = facade.service();
    let process = match service.create_process(system, &document) {
        CallOutcome::Completed(process) => process,
        CallOutcome::Pending(process) => {
            tracing::debug!(process_id = process.process_id, "guest process create pending, not waiting");
            process
        }
        CallOutcome::Failed(source) => {
            return Err(ControlError::Call {
                operation: Operation::CreateProcess,
                source,
            })
        }
    };

    let process_id = process.process_id;
    let handle = process.handle;
    let mut io = process.io;

    if io.is_absent() {
        tracing::info!(process_id, "agent channel returned no stdio, falling back to serial console");
        if let Err(e) = service.close_process(handle) {
            tracing::warn!(error = %e, "close guest process failed");
        }
        return Ok(GuestRun::Unsupported);
    }

    let HostStdio {
        mut input,
        mut output,
        mut error,
    } = stdio;

    let stdin_task = io.stdin.take().map(|mut guest_in| {
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut input, &mut guest_in).await {
                tracing::debug!(error = %e, "host input to guest stdin ended");
            }
            let _ = guest_in.shutdown().await;
        })
    });

    let stderr_task = io.stderr.take().map(|mut guest_err| {
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut guest_err, &mut error).await {
                tracing::debug!(error = %e, "guest stderr copy ended");
            }
        })
    });

    let copied = match io.stdout.take() {
        Some(mut guest_out) => tokio::io::copy(&mut guest_out, &mut output).await.map(|_| ()),
        None => Ok(()),
    };

    for task in [stdin_task, stderr_task].into_iter().flatten() {
        task.abort();
    }
    if let Err(e) = service.close_process(handle) {
        tracing::warn!(error = %e, "close guest process failed");
    }

    copied?;
    let _ = output.flush().await;
    Ok(GuestRun::Completed {
        process_id,
        exit_code: 0,
    })
}
