//! The `run` subcommand: one command in a disposable container.
//!
//! Also hosts the hidden `receive-fds` step that `run` places between the
//! privilege wrapper and the runtime when descriptors are forwarded.

use std::convert::Infallible;
use std::env;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};
use std::time::Duration;

use nspawn_config::{Config, ScratchPaths};
use nspawn_sandbox::{
    BtrfsSnapshotStore, DescriptorReceiver, HostContext, PopenArgs, Redirect, RuntimeSettings,
    Sandbox, SandboxConfig, Subvolume, TargetUser, receive_and_exec,
};
use tracing::{debug, info};

use crate::AppError;
use crate::CLI_TARGET;
use crate::cli::{DEFAULT_COMMAND, ReceiveFdsArgs, RunArgs};
use crate::shutdown::InterruptShield;

/// Hidden subcommand that receives forwarded descriptors.
pub(crate) const RECEIVER_SUBCOMMAND: &str = "receive-fds";

const SIGNAL_EXIT_BASE: i32 = 128;

/// Translates parsed `run` arguments into a validated configuration.
pub(crate) fn build_sandbox_config(args: &RunArgs) -> Result<SandboxConfig, AppError> {
    let command = if args.command.is_empty() {
        vec![OsString::from(DEFAULT_COMMAND)]
    } else {
        args.command.clone()
    };
    let mut builder = SandboxConfig::builder(Subvolume::new(&args.layer), command);

    if let Some(name) = &args.user {
        builder = builder.user(TargetUser::lookup(name)?);
    }
    if args.bind_repo_ro {
        builder = builder.bind_repo_ro();
    }
    for (source, destination) in bind_pairs(&args.bindmount_ro) {
        builder = builder.bindmount_ro(source, destination);
    }
    for (source, destination) in bind_pairs(&args.bindmount_rw) {
        builder = builder.bindmount_rw(source, destination);
    }
    for fd in &args.forward_fd {
        builder = builder.forward_fd(*fd);
    }
    if let Some(hostname) = &args.hostname {
        builder = builder.hostname(hostname.clone());
    }
    if args.quiet {
        builder = builder.quiet();
    }
    if args.allow_mknod {
        builder = builder.allow_mknod();
    }
    if args.no_snapshot {
        builder = builder.without_snapshot();
    }
    for assignment in &args.setenv {
        builder = builder.setenv_assignment(assignment.clone());
    }
    if let Some(debug) = args.debug.to_options() {
        builder = builder.debug_options_not_for_production(debug);
    }
    Ok(builder.build()?)
}

fn bind_pairs(flat: &[PathBuf]) -> impl Iterator<Item = (&PathBuf, &PathBuf)> {
    flat.chunks_exact(2).filter_map(|pair| match pair {
        [source, destination] => Some((source, destination)),
        _ => None,
    })
}

/// Runs the sandbox and mirrors the guest's exit status.
pub(crate) fn run_sandbox(args: &RunArgs, config: &Config) -> Result<ExitCode, AppError> {
    let sandbox_config = build_sandbox_config(args)?;
    let wrapper = [config.sudo_binary().as_str()];
    let sandbox = Sandbox::new(
        BtrfsSnapshotStore::new(wrapper),
        runtime_settings(config, !sandbox_config.forward_fd().is_empty())?,
        HostContext::detect(),
    );

    let shield = InterruptShield::raise()?;
    let outcome = sandbox
        .launch(
            &sandbox_config,
            PopenArgs::default().stdout(Redirect::Inherit).unchecked(),
        )?
        .wait_or_terminate(shield.termination())?;
    drop(shield);

    let code = exit_status_code(outcome.status);
    if outcome.status.success() {
        debug!(target: CLI_TARGET, "sandboxed command succeeded");
    } else {
        info!(target: CLI_TARGET, status = %outcome.status, code, "sandboxed command failed");
    }
    Ok(exit_code(code))
}

/// Runtime settings for `config`. Forwarding descriptors configures this
/// executable's `receive-fds` step behind the privilege wrapper.
pub(crate) fn runtime_settings(
    config: &Config,
    forwards: bool,
) -> Result<RuntimeSettings, AppError> {
    let mut settings = RuntimeSettings::new()
        .with_nspawn_binary(config.nspawn_binary().as_str())
        .with_privilege_wrapper([config.sudo_binary().as_str()]);
    if let Some(dir) = config.snapshot_dir() {
        settings = settings.with_snapshot_dir(dir.as_std_path());
    }
    if forwards {
        let scratch = ScratchPaths::from_config(config)?;
        let executable = env::current_exe().map_err(AppError::CurrentExe)?;
        settings = settings.with_descriptor_receiver(DescriptorReceiver::new(
            [executable.into_os_string(), OsString::from(RECEIVER_SUBCOMMAND)],
            scratch.rendezvous(),
            config.handoff_timeout(),
        ));
    }
    Ok(settings)
}

/// Takes the forwarded descriptors and becomes the runtime.
pub(crate) fn receive_fds(args: &ReceiveFdsArgs) -> Result<Infallible, AppError> {
    debug!(target: CLI_TARGET, count = args.count, "receiving forwarded descriptors");
    receive_and_exec(
        &args.rendezvous,
        args.count,
        Duration::from_millis(args.timeout_ms),
        &args.command,
    )
    .map_err(AppError::from)
}

/// Shell-style exit code: the status itself, or 128 plus the signal.
pub(crate) fn exit_status_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => SIGNAL_EXIT_BASE + signal,
        (None, None) => 1,
    }
}

pub(crate) fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
