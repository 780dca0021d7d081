//! The `serve-repos` subcommand.

use std::env;

use netns_handoff::{HandoffSettings, NsenterLauncher, RepoServerSettings, serve_repos};
use nspawn_config::{Config, ScratchPaths};
use tracing::info;

use crate::AppError;
use crate::CLI_TARGET;
use crate::cli::ServeReposArgs;
use crate::shutdown::ShutdownSignal;

/// Subcommand the courier runs under inside the target namespace.
pub(crate) const COURIER_SUBCOMMAND: &str = "send-sockets";

/// Starts one repo server per listed port, then holds them until `shutdown`
/// fires and stops them newest first.
pub(crate) fn serve(
    args: &ServeReposArgs,
    config: &Config,
    shutdown: &dyn ShutdownSignal,
) -> Result<(), AppError> {
    let scratch = ScratchPaths::from_config(config)?;
    let launcher = courier_launcher(config)?;
    let handoff = HandoffSettings::new(scratch.rendezvous(), config.handoff_timeout());
    let settings =
        RepoServerSettings::new(config.repo_server_binary().as_std_path(), &args.snapshot_dir)
            .with_debug(args.debug)
            .with_poll_interval(config.readiness_poll());

    let fleet = serve_repos(args.target_pid, &launcher, &handoff, &settings)?;
    info!(
        target: CLI_TARGET,
        target_pid = args.target_pid,
        ports = ?fleet.ports(),
        "repo servers ready"
    );

    let waited = shutdown.wait();
    let stopped = fleet.shutdown();
    info!(target: CLI_TARGET, ports = ?stopped, "repo servers stopped");
    waited.map_err(AppError::from)
}

fn courier_launcher(config: &Config) -> Result<NsenterLauncher, AppError> {
    let executable = env::current_exe().map_err(AppError::CurrentExe)?;
    Ok(
        NsenterLauncher::new([executable.into_os_string(), COURIER_SUBCOMMAND.into()])
            .with_privilege_wrapper([config.sudo_binary().as_str()])
            .with_privileged_path(config.privileged_path())
            .with_nsenter(config.nsenter_binary().as_str()),
    )
}
