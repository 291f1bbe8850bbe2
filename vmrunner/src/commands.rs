//! Subcommand implementations.
//!
//! Each command is generic over the compute service and the console
//! connector so the whole flow can be driven without a hypervisor.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use vmrunner_compute::{
    run_in_guest, ComputeService, ControlError, ControlFacade, GuestRun, HostStdio, SystemHandle, Vm,
};
use vmrunner_console::{session, ChannelConnector, HostInput, SessionOptions};
use vmrunner_core::{VmConfig, VmId};

use crate::cli::{AttachArgs, Cli, Command, ExecArgs, RunArgs};
use crate::{signal, CliError};

/// Run the subcommand selected on the command line.
///
/// # Errors
/// Whatever the selected command fails with.
pub async fn dispatch<S, C>(cli: Cli, facade: &ControlFacade<S>, connector: &C) -> Result<(), CliError>
where
    S: ComputeService,
    C: ChannelConnector,
{
    match cli.into_command() {
        Command::Run(args) => run(facade, connector, &args).await,
        Command::Exec(args) => exec(facade, connector, &args).await,
        Command::Attach(args) => attach(facade, connector, &args).await,
        Command::Stop { vm_id } => stop(facade, &vm_id).await,
        Command::Kill { vm_id } => kill(facade, &vm_id).await,
    }
}

fn print_document(config: &VmConfig) -> Result<(), CliError> {
    let document = config.to_document()?;
    println!("{document}");
    Ok(())
}

/// Start a VM. With `-i`, attach to its console and shut it down when the
/// session ends or the host asks to stop; otherwise leave it running.
///
/// # Errors
/// Start failures, and in interactive mode the session error or the
/// shutdown error, in that order of precedence.
pub async fn run<S, C>(facade: &ControlFacade<S>, connector: &C, args: &RunArgs) -> Result<(), CliError>
where
    S: ComputeService,
    C: ChannelConnector,
{
    let config = args.vm.vm_config();
    if args.debug() {
        print_document(&config)?;
    }

    let vm = Vm::start(facade, &config).await?;
    if !args.interactive {
        tracing::info!(pipe = %vm.pipe_name(), "VM running, attach with `vmrunner attach {}`", vm.id());
        vm.detach()?;
        return Ok(());
    }

    interactive(
        vm,
        connector,
        HostInput::raw(),
        tokio::io::stdout(),
        signal::shutdown_requested(),
        &args.session_options(),
    )
    .await
}

/// Run a console session on `vm` until it ends or `shutdown` resolves, then
/// shut the VM down.
async fn interactive<S, C, I, O, F>(
    vm: Vm<S>,
    connector: &C,
    host_in: I,
    host_out: O,
    shutdown: F,
    options: &SessionOptions,
) -> Result<(), CliError>
where
    S: ComputeService,
    C: ChannelConnector,
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
    F: Future<Output = ()>,
{
    let session = tokio::select! {
        result = session::attach(connector, vm.pipe_name(), host_in, host_out, options) => result,
        () = shutdown => {
            tracing::info!("interrupted");
            Ok(())
        }
    };
    if let Err(e) = &session {
        tracing::error!(error = %e, "console session failed");
    }
    tracing::debug!(vm_id = %vm.id(), started_at = %vm.started_at(), "console session over");

    let stopped = vm.shutdown().await;
    session?;
    stopped?;
    Ok(())
}

/// `primary` unless it succeeded and `cleanup` did not.
fn after_cleanup<T>(primary: Result<T, CliError>, cleanup: Result<(), ControlError>) -> Result<T, CliError> {
    match (primary, cleanup) {
        (primary, Ok(())) => primary,
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Err(cleanup)) => {
            tracing::warn!(error = %cleanup, "releasing the VM handle failed");
            Err(e)
        }
    }
}

/// Run a command in the guest.
///
/// A running VM is reused and left running. Otherwise one is started from
/// the given options and detached afterwards. With `--agent` the in-guest
/// agent is tried first; the serial console is used when it has no I/O.
///
/// # Errors
/// Start failures, agent failures and console errors.
pub async fn exec<S, C>(facade: &ControlFacade<S>, connector: &C, args: &ExecArgs) -> Result<(), CliError>
where
    S: ComputeService,
    C: ChannelConnector,
{
    let options = args.session_options();
    let id = &args.vm.vm_id;

    if let Ok(system) = facade.open(id) {
        tracing::debug!(vm_id = %id, "VM already running");
        let ran = if args.agent {
            run_agent(facade, &system, &args.command).await
        } else {
            Ok(false)
        };
        if !after_cleanup(ran, facade.close(system))? {
            session::exec_command(connector, &id.console_pipe_name(), &args.command, &options).await?;
        }
        return Ok(());
    }

    let config = args.vm.vm_config();
    if args.vm.debug {
        print_document(&config)?;
    }
    let vm = Vm::start(facade, &config).await?;
    let result = exec_on(facade, connector, &vm, args, &options).await;
    after_cleanup(result, vm.detach())
}

async fn exec_on<S, C>(
    facade: &ControlFacade<S>,
    connector: &C,
    vm: &Vm<S>,
    args: &ExecArgs,
    options: &SessionOptions,
) -> Result<(), CliError>
where
    S: ComputeService,
    C: ChannelConnector,
{
    if args.agent && run_agent(facade, vm.system(), &args.command).await? {
        return Ok(());
    }
    session::exec_command(connector, vm.pipe_name(), &args.command, options).await?;
    Ok(())
}

/// Returns `false` when the agent cannot serve the command.
///
/// Host input is read on a thread of its own, so a guest that exits while
/// nothing is typed does not leave a read holding up shutdown.
async fn run_agent<S: ComputeService>(
    facade: &ControlFacade<S>,
    system: &SystemHandle,
    command: &[String],
) -> Result<bool, CliError> {
    let stdio = HostStdio::with_input(Box::new(HostInput::plain()));
    match run_in_guest(facade, system, command, stdio).await? {
        GuestRun::Completed { process_id, exit_code } => {
            tracing::info!(process_id, exit_code, "guest process finished");
            Ok(true)
        }
        GuestRun::Unsupported => {
            tracing::warn!("in-guest agent has no I/O channel, using the serial console");
            Ok(false)
        }
    }
}

/// Attach the terminal to a running VM's console.
///
/// # Errors
/// [`vmrunner_compute::ControlError::NotFound`] if the VM is not running,
/// then any console error.
pub async fn attach<S, C>(facade: &ControlFacade<S>, connector: &C, args: &AttachArgs) -> Result<(), CliError>
where
    S: ComputeService,
    C: ChannelConnector,
{
    let pipe = vmrunner_compute::probe(facade, &args.vm_id)?;
    let options = SessionOptions::default().with_trace(args.trace);
    session::attach(connector, &pipe, HostInput::raw(), tokio::io::stdout(), &options).await?;
    Ok(())
}

/// # Errors
/// [`vmrunner_compute::ControlError::NotFound`] or the shutdown error.
pub async fn stop<S: ComputeService>(facade: &ControlFacade<S>, id: &VmId) -> Result<(), CliError> {
    vmrunner_compute::stop(facade, id).await?;
    tracing::info!(vm_id = %id, "VM stopped");
    Ok(())
}

/// # Errors
/// [`vmrunner_compute::ControlError::NotFound`] or the terminate error.
pub async fn kill<S: ComputeService>(facade: &ControlFacade<S>, id: &VmId) -> Result<(), CliError> {
    vmrunner_compute::kill(facade, id).await?;
    tracing::info!(vm_id = %id, "VM terminated");
    Ok(())
}
