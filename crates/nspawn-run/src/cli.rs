//! CLI argument definitions for `nspawn-run`.

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use nspawn_sandbox::{DebugOptions, EnvAssignment};

/// Command run when none is given.
pub(crate) const DEFAULT_COMMAND: &str = "/bin/bash";

/// Runs build steps in disposable containers and serves package
/// repositories into them.
#[derive(Parser, Debug)]
#[command(
    name = "nspawn-run",
    version,
    disable_help_subcommand = true,
    after_help = "Configuration flags (for example --log-filter or --config-path) go before \
                  the subcommand."
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Runs a command in an ephemeral snapshot of a layer.
    Run(RunArgs),
    /// Starts repo servers reachable on loopback inside a running container.
    ServeRepos(ServeReposArgs),
    /// Creates sockets in the current network namespace and hands them over.
    #[command(hide = true)]
    SendSockets(SendSocketsArgs),
    /// Receives forwarded descriptors after the privilege wrapper and execs
    /// the runtime with them.
    #[command(hide = true)]
    ReceiveFds(ReceiveFdsArgs),
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Layer subvolume the container is built from.
    #[arg(long, value_name = "PATH")]
    pub(crate) layer: PathBuf,
    /// Account the command runs as inside the container.
    #[arg(long, value_name = "NAME")]
    pub(crate) user: Option<String>,
    /// Binds the repository containing the working directory read-only.
    #[arg(long)]
    pub(crate) bind_repo_ro: bool,
    /// Binds a host path read-only into the container.
    #[arg(
        long,
        num_args = 2,
        value_names = ["SRC", "DEST"],
        action = ArgAction::Append
    )]
    pub(crate) bindmount_ro: Vec<PathBuf>,
    /// Binds a host path read-write into the container.
    #[arg(
        long,
        num_args = 2,
        value_names = ["SRC", "DEST"],
        action = ArgAction::Append
    )]
    pub(crate) bindmount_rw: Vec<PathBuf>,
    /// Forwards a descriptor; the first lands on 3 inside the container.
    #[arg(long, value_name = "FD")]
    pub(crate) forward_fd: Vec<RawFd>,
    /// Container hostname.
    #[arg(long, value_name = "NAME")]
    pub(crate) hostname: Option<String>,
    /// Silences the runtime's own status output.
    #[arg(long)]
    pub(crate) quiet: bool,
    /// Sets a variable in the command's environment.
    #[arg(long, value_name = "KEY=VALUE")]
    pub(crate) setenv: Vec<EnvAssignment>,
    /// Runs directly on the layer instead of a snapshot.
    #[arg(long)]
    pub(crate) no_snapshot: bool,
    /// Keeps `CAP_MKNOD` inside the container.
    #[arg(long)]
    pub(crate) allow_mknod: bool,
    #[command(flatten)]
    pub(crate) debug: DebugArgs,
    /// Command and arguments, after `--`.
    #[arg(last = true, value_name = "CMD")]
    pub(crate) command: Vec<OsString>,
}

/// Knobs that weaken isolation.
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
#[command(next_help_heading = "Debug-only options (never use in production)")]
pub(crate) struct DebugArgs {
    /// Logs at debug level and lets the runtime report verbosely.
    #[arg(long)]
    pub(crate) debug: bool,
    /// Copies `THRIFT_TLS_*` variables into the container.
    #[arg(long)]
    pub(crate) forward_tls_env: bool,
    /// Skips the private `/logs` tmpfs.
    #[arg(long)]
    pub(crate) no_logs_tmpfs: bool,
    /// Keeps the snapshot at this path instead of deleting it.
    #[arg(long, value_name = "PATH")]
    pub(crate) snapshot_into: Option<PathBuf>,
    /// Grants `CAP_NET_ADMIN`.
    #[arg(long)]
    pub(crate) cap_net_admin: bool,
    /// Shares the host network namespace.
    #[arg(long)]
    pub(crate) no_private_network: bool,
}

impl DebugArgs {
    /// Debug options when any knob was used.
    pub(crate) fn to_options(&self) -> Option<DebugOptions> {
        if *self == Self::default() {
            return None;
        }
        let mut builder = DebugOptions::not_for_production();
        if self.debug {
            builder = builder.verbose();
        }
        if self.forward_tls_env {
            builder = builder.forward_tls_env();
        }
        if self.no_logs_tmpfs {
            builder = builder.without_logs_tmpfs();
        }
        if let Some(path) = &self.snapshot_into {
            builder = builder.snapshot_into(path);
        }
        if self.cap_net_admin {
            builder = builder.cap_net_admin();
        }
        if self.no_private_network {
            builder = builder.share_host_network();
        }
        Some(builder.build())
    }
}

#[derive(Args, Debug)]
pub(crate) struct ServeReposArgs {
    /// Process whose network namespace receives the servers' sockets.
    #[arg(long, value_name = "PID")]
    pub(crate) target_pid: u32,
    /// Snapshot holding `repo_server_ports` and the repositories.
    #[arg(long, value_name = "DIR")]
    pub(crate) snapshot_dir: PathBuf,
    /// Passes `--debug` to the servers and logs at debug level.
    #[arg(long)]
    pub(crate) debug: bool,
}

#[derive(Args, Debug)]
pub(crate) struct SendSocketsArgs {
    /// Number of sockets to create.
    #[arg(long)]
    pub(crate) count: usize,
    /// Inherited listening descriptor of the rendezvous channel.
    #[arg(long, value_name = "FD")]
    pub(crate) listen_fd: RawFd,
    /// Bound on each wait, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 3_000)]
    pub(crate) timeout_ms: u64,
}

#[derive(Args, Debug)]
pub(crate) struct ReceiveFdsArgs {
    /// Socket the orchestrator listens on.
    #[arg(long, value_name = "PATH")]
    pub(crate) rendezvous: PathBuf,
    /// Number of descriptors to receive.
    #[arg(long)]
    pub(crate) count: usize,
    /// Bound on connecting and on the transfer, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 3_000)]
    pub(crate) timeout_ms: u64,
    /// Runtime command line, after `--`.
    #[arg(last = true, required = true, value_name = "CMD")]
    pub(crate) command: Vec<OsString>,
}

impl CliCommand {
    /// Whether the subcommand asked for debug logging.
    pub(crate) const fn verbose(&self) -> bool {
        match self {
            Self::Run(args) => args.debug.debug,
            Self::ServeRepos(args) => args.debug,
            Self::SendSockets(_) | Self::ReceiveFds(_) => false,
        }
    }
}
