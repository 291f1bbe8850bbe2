//! Command-line definition.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use vmrunner_compute::LifecycleTimeouts;
use vmrunner_console::SessionOptions;
use vmrunner_core::{VmConfig, VmId, DEFAULT_IMAGE_DIR, DEFAULT_VM_ID};

/// Run a Linux utility VM on the Host Compute Service and talk to it over
/// its serial console.
#[derive(Debug, Parser)]
#[command(name = "vmrunner", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub timeouts: TimeoutArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Lifecycle wait limits from the `--*-timeout` flags.
    #[must_use]
    pub fn lifecycle_timeouts(&self) -> LifecycleTimeouts {
        let mut timeouts = LifecycleTimeouts::default();
        timeouts.create = Duration::from_secs(self.timeouts.create_timeout);
        timeouts.start = Duration::from_secs(self.timeouts.start_timeout);
        timeouts.shutdown = Duration::from_secs(self.timeouts.shutdown_timeout);
        timeouts.terminate = Duration::from_secs(self.timeouts.terminate_timeout);
        timeouts
    }

    /// The subcommand to run. No subcommand means `run` with defaults.
    #[must_use]
    pub fn into_command(self) -> Command {
        self.command.unwrap_or_else(|| Command::Run(RunArgs::default()))
    }
}

/// Seconds to wait for each lifecycle operation to finish.
#[derive(Debug, Clone, Args)]
pub struct TimeoutArgs {
    #[arg(long, global = true, default_value_t = 60)]
    pub create_timeout: u64,

    #[arg(long, global = true, default_value_t = 120)]
    pub start_timeout: u64,

    #[arg(long, global = true, default_value_t = 30)]
    pub shutdown_timeout: u64,

    #[arg(long, global = true, default_value_t = 10)]
    pub terminate_timeout: u64,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create and start a VM, optionally attaching to its console.
    Run(RunArgs),

    /// Run a command in the VM over its serial console, starting it if needed.
    Exec(ExecArgs),

    /// Attach the terminal to the console of a running VM.
    Attach(AttachArgs),

    /// Gracefully shut down a running VM.
    Stop {
        /// VM identifier.
        vm_id: VmId,
    },

    /// Forcibly terminate a running VM.
    Kill {
        /// VM identifier.
        vm_id: VmId,
    },
}

/// Options describing the VM to create.
#[derive(Debug, Clone, Args)]
pub struct VmArgs {
    /// VM identifier.
    #[arg(long = "id", default_value = DEFAULT_VM_ID)]
    pub vm_id: VmId,

    /// Memory size in megabytes.
    #[arg(long, default_value_t = 2048)]
    pub memory: u32,

    /// Number of virtual processors.
    #[arg(long, default_value_t = 2)]
    pub cpu: u32,

    /// Directory holding vmlinuz, initrd and rootfs.vhdx.
    #[arg(long, default_value = DEFAULT_IMAGE_DIR)]
    pub image_dir: String,

    /// Kernel command line.
    #[arg(long)]
    pub kernel_args: Option<String>,

    /// Print the rendered configuration document before creating the VM.
    #[arg(long)]
    pub debug: bool,
}

impl Default for VmArgs {
    fn default() -> Self {
        Self {
            vm_id: VmId::default(),
            memory: 2048,
            cpu: 2,
            image_dir: DEFAULT_IMAGE_DIR.to_owned(),
            kernel_args: None,
            debug: false,
        }
    }
}

impl VmArgs {
    #[must_use]
    pub fn vm_config(&self) -> VmConfig {
        let mut config = VmConfig::new(self.vm_id.clone(), self.image_dir.clone());
        config.memory_mb = self.memory;
        config.cpu_count = self.cpu;
        config.kernel_args = self.kernel_args.clone().unwrap_or_default();
        config
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub vm: VmArgs,

    /// Attach to the serial console and shut the VM down on exit.
    #[arg(short, long)]
    pub interactive: bool,

    /// Log everything typed into the console. Implies --debug.
    #[arg(long)]
    pub trace: bool,
}

impl RunArgs {
    #[must_use]
    pub fn debug(&self) -> bool {
        self.vm.debug || self.trace
    }

    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::default().with_trace(self.trace)
    }
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    #[command(flatten)]
    pub vm: VmArgs,

    /// Seconds to wait for the console pipe.
    #[arg(long, default_value_t = 30)]
    pub open_timeout: u64,

    /// Try the in-guest agent before the serial console.
    #[arg(long)]
    pub agent: bool,

    /// Command and arguments to run in the guest shell.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl ExecArgs {
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::default().with_open_timeout(Duration::from_secs(self.open_timeout))
    }
}

#[derive(Debug, Clone, Args)]
pub struct AttachArgs {
    /// VM identifier.
    pub vm_id: VmId,

    /// Log everything typed into the console.
    #[arg(long)]
    pub trace: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        match Cli::try_parse_from(args) {
            Ok(cli) => cli.into_command(),
            Err(e) => panic!("parse failed: {e}"),
        }
    }

    #[test]
    fn no_subcommand_runs_with_defaults() {
        let Command::Run(run) = parse(&["vmrunner"]) else {
            panic!("expected run");
        };
        assert!(!run.interactive);
        assert_eq!(run.vm.vm_id.as_str(), DEFAULT_VM_ID);
        let config = run.vm.vm_config();
        assert_eq!(config.memory_mb, 2048);
        assert_eq!(config.cpu_count, 2);
        assert_eq!(config.image_dir, DEFAULT_IMAGE_DIR);
    }

    #[test]
    fn run_flags_are_parsed() {
        let Command::Run(run) = parse(&[
            "vmrunner", "run", "-i", "--trace", "--id", "dev", "--memory", "4096", "--cpu", "4",
            "--kernel-args", "console=ttyS0 quiet",
        ]) else {
            panic!("expected run");
        };
        assert!(run.interactive);
        assert!(run.debug(), "trace implies debug");
        assert!(run.session_options().trace);

        let config = run.vm.vm_config();
        assert_eq!(config.vm_id.as_str(), "dev");
        assert_eq!(config.memory_mb, 4096);
        assert_eq!(config.cpu_count, 4);
        assert_eq!(config.kernel_args, "console=ttyS0 quiet");
    }

    #[test]
    fn exec_keeps_hyphenated_guest_arguments() {
        let Command::Exec(exec) = parse(&["vmrunner", "exec", "--id", "dev", "ls", "-la", "/"]) else {
            panic!("expected exec");
        };
        assert_eq!(exec.command, ["ls", "-la", "/"]);
        assert_eq!(exec.vm.vm_id.as_str(), "dev");
        assert_eq!(exec.session_options().open_timeout, Duration::from_secs(30));
        assert!(!exec.agent);
    }

    #[test]
    fn timeout_flags_default_to_lifecycle_defaults() {
        let cli = Cli::parse_from(["vmrunner"]);
        assert_eq!(cli.lifecycle_timeouts(), LifecycleTimeouts::default());
    }

    #[test]
    fn timeout_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::parse_from([
            "vmrunner", "--start-timeout", "300", "stop", "dev", "--terminate-timeout", "5",
        ]);
        let timeouts = cli.lifecycle_timeouts();
        assert_eq!(timeouts.start, Duration::from_secs(300));
        assert_eq!(timeouts.terminate, Duration::from_secs(5));
        assert_eq!(timeouts.create, Duration::from_secs(60));
        assert_eq!(timeouts.shutdown, Duration::from_secs(30));
    }

    #[test]
    fn exec_requires_a_command() {
        assert!(Cli::try_parse_from(["vmrunner", "exec"]).is_err());
    }

    #[test]
    fn lifecycle_subcommands_take_an_id() {
        assert!(matches!(parse(&["vmrunner", "stop", "a"]), Command::Stop { vm_id } if vm_id.as_str() == "a"));
        assert!(matches!(parse(&["vmrunner", "kill", "b"]), Command::Kill { vm_id } if vm_id.as_str() == "b"));
        assert!(matches!(
            parse(&["vmrunner", "attach", "c", "--trace"]),
            Command::Attach(AttachArgs { vm_id, trace: true }) if vm_id.as_str() == "c"
        ));
        assert!(Cli::try_parse_from(["vmrunner", "stop"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
