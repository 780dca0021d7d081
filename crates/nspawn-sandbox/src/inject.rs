//! Descriptor injection across a privilege wrapper.
//!
//! `sudo` closes every inherited descriptor above standard error unless the
//! site policy allows `--close-from`. Forwarded descriptors therefore travel
//! out of band: the orchestrator listens on a private rendezvous socket, the
//! wrapper starts a receiver, and the receiver connects by path, takes the
//! batch over `SCM_RIGHTS`, installs it on descriptors 3, 4, … and `exec`s
//! the runtime with the socket-activation variables naming its own pid.

use std::convert::Infallible;
use std::ffi::OsString;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::time::Duration;

use netns_handoff::{HandoffError, Rendezvous, receive_descriptor_batch, send_descriptor_batch};
use tracing::debug;

use crate::error::{ConfigurationError, SandboxError};
use crate::forward::install_forwarded;

const INJECT_TARGET: &str = "nspawn_sandbox::inject";

/// Program that receives forwarded descriptors after the privilege wrapper.
///
/// The program is invoked as
/// `<program…> --rendezvous <path> --count <n> --timeout-ms <ms> -- <runtime…>`
/// and is expected to call [`receive_and_exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorReceiver {
    program: Vec<OsString>,
    rendezvous_dir: PathBuf,
    timeout: Duration,
}

impl DescriptorReceiver {
    /// Receiver run as `program`, rendezvousing under `rendezvous_dir`.
    #[must_use]
    pub fn new<I, S>(program: I, rendezvous_dir: impl Into<PathBuf>, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into_iter().map(Into::into).collect(),
            rendezvous_dir: rendezvous_dir.into(),
            timeout,
        }
    }

    /// Receiver argv prefix.
    #[must_use]
    pub fn program(&self) -> &[OsString] {
        &self.program
    }

    /// Directory holding rendezvous sockets.
    #[must_use]
    pub fn rendezvous_dir(&self) -> &Path {
        &self.rendezvous_dir
    }

    /// Bound on the receiver connecting and on the transfer.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arguments that run the receiver in front of `runtime`.
    #[must_use]
    pub fn argv(&self, rendezvous: &Path, count: usize, runtime: &[OsString]) -> Vec<OsString> {
        let mut argv = self.program.clone();
        argv.extend([
            OsString::from("--rendezvous"),
            rendezvous.as_os_str().to_os_string(),
            OsString::from("--count"),
            OsString::from(count.to_string()),
            OsString::from("--timeout-ms"),
            OsString::from(self.timeout.as_millis().to_string()),
            OsString::from("--"),
        ]);
        argv.extend_from_slice(runtime);
        argv
    }

    pub(crate) fn open(&self) -> Result<PendingInjection, HandoffError> {
        let (rendezvous, channel) = Rendezvous::open(&self.rendezvous_dir)?;
        Ok(PendingInjection {
            rendezvous,
            channel,
            timeout: self.timeout,
        })
    }
}

/// A rendezvous waiting for the receiver to connect.
#[derive(Debug)]
pub(crate) struct PendingInjection {
    rendezvous: Rendezvous,
    channel: OwnedFd,
    timeout: Duration,
}

impl PendingInjection {
    pub(crate) fn path(&self) -> &Path {
        self.rendezvous.path()
    }

    /// Hands `fds` to the receiver. The socket directory goes away afterwards.
    pub(crate) fn deliver(self, fds: &[RawFd]) -> Result<(), HandoffError> {
        debug!(
            target: INJECT_TARGET,
            path = %self.rendezvous.path().display(),
            count = fds.len(),
            "waiting for descriptor receiver"
        );
        send_descriptor_batch(self.channel, fds, self.timeout)
    }
}

/// Receives `count` descriptors from `rendezvous`, installs them from
/// descriptor 3 upwards, and replaces the process with `command`.
///
/// `LISTEN_FDS` and `LISTEN_PID` are set for `command`, which keeps this
/// process's pid; `LISTEN_FDNAMES` is removed.
///
/// # Errors
///
/// Only returns on failure: [`SandboxError::Injection`] when the batch does
/// not arrive, [`SandboxError::Configuration`] for an empty command, and
/// [`SandboxError::Launch`] when installing or `exec` fails.
pub fn receive_and_exec(
    rendezvous: &Path,
    count: usize,
    timeout: Duration,
    command: &[OsString],
) -> Result<Infallible, SandboxError> {
    let Some((head, tail)) = command.split_first() else {
        return Err(ConfigurationError::EmptyCommand.into());
    };
    let program = head.to_string_lossy().into_owned();
    let received = receive_descriptor_batch(rendezvous, count, timeout)?;
    // Ownership ends here: targets may reuse these numbers, and the rest are
    // close-on-exec.
    let sources: Vec<RawFd> = received.into_iter().map(IntoRawFd::into_raw_fd).collect();
    install_forwarded(&sources).map_err(|source| SandboxError::Launch {
        program: program.clone(),
        source,
    })?;
    debug!(target: INJECT_TARGET, count, %program, "descriptors installed");

    let source = Command::new(head)
        .args(tail)
        .env("LISTEN_FDS", count.to_string())
        .env("LISTEN_PID", process::id().to_string())
        .env_remove("LISTEN_FDNAMES")
        .exec();
    Err(SandboxError::Launch { program, source })
}
