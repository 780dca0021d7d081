//! Orchestrator side of the cross-namespace socket handoff.
//!
//! [`create_sockets_in_netns`] opens a rendezvous channel, starts a courier in
//! the target's network namespace with the listening end as its only channel,
//! receives the whole batch, and then insists that the courier exits
//! successfully. Any failure yields no sockets.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::socket::{getsockopt, sockopt};
use socket2::{SockAddr, Socket};
use tracing::{debug, info, warn};

use crate::HANDOFF_TARGET;
use crate::error::{HandoffError, HandoffStage};
use crate::rendezvous::Rendezvous;

/// Descriptor through which the courier receives the rendezvous listener.
pub const COURIER_CHANNEL_FD: RawFd = 1;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_PRIVILEGED_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// What the courier is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CourierRequest {
    target_pid: u32,
    count: usize,
    timeout: Duration,
}

impl CourierRequest {
    /// Requests `count` sockets from the namespace of `target_pid`.
    #[must_use]
    pub const fn new(target_pid: u32, count: usize, timeout: Duration) -> Self {
        Self {
            target_pid,
            count,
            timeout,
        }
    }

    /// Process whose network namespace is entered.
    #[must_use]
    pub const fn target_pid(&self) -> u32 {
        self.target_pid
    }

    /// Number of sockets requested.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Bound on each courier wait.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arguments understood by the courier entry point.
    #[must_use]
    pub fn courier_args(&self) -> Vec<OsString> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        vec![
            OsString::from("--count"),
            OsString::from(self.count.to_string()),
            OsString::from("--listen-fd"),
            OsString::from(COURIER_CHANNEL_FD.to_string()),
            OsString::from("--timeout-ms"),
            OsString::from(timeout_ms.to_string()),
        ]
    }
}

/// Starts the courier process for a handoff.
#[cfg_attr(test, mockall::automock)]
pub trait CourierLauncher {
    /// Spawns the courier with `channel` installed as its
    /// [`COURIER_CHANNEL_FD`].
    ///
    /// # Errors
    ///
    /// Returns the spawn failure.
    fn launch(&self, request: &CourierRequest, channel: OwnedFd) -> io::Result<Child>;
}

/// Launches the courier through a privilege wrapper and `nsenter --net`.
///
/// The full command line is
/// `<wrapper...> env PATH=<path> <nsenter> --net --target <pid> <courier...>
/// --count N --listen-fd 1 --timeout-ms T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsenterLauncher {
    privilege_wrapper: Vec<OsString>,
    privileged_path: String,
    nsenter: OsString,
    courier: Vec<OsString>,
}

impl NsenterLauncher {
    /// Uses `courier` (program and leading arguments) as the entry point.
    #[must_use]
    pub fn new<I, S>(courier: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            privilege_wrapper: vec![OsString::from("sudo")],
            privileged_path: DEFAULT_PRIVILEGED_PATH.to_owned(),
            nsenter: OsString::from("nsenter"),
            courier: courier.into_iter().map(Into::into).collect(),
        }
    }

    /// Replaces the privilege wrapper. An empty wrapper runs `env` directly.
    #[must_use]
    pub fn with_privilege_wrapper<I, S>(mut self, wrapper: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.privilege_wrapper = wrapper.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the `PATH` seen by the privileged command.
    #[must_use]
    pub fn with_privileged_path(mut self, path: impl Into<String>) -> Self {
        self.privileged_path = path.into();
        self
    }

    /// Sets the namespace entry tool.
    #[must_use]
    pub fn with_nsenter(mut self, nsenter: impl Into<OsString>) -> Self {
        self.nsenter = nsenter.into();
        self
    }

    /// Full argument vector for `request`, program first.
    #[must_use]
    pub fn argv(&self, request: &CourierRequest) -> Vec<OsString> {
        let mut argv = self.privilege_wrapper.clone();
        argv.push(OsString::from("env"));
        argv.push(OsString::from(format!("PATH={}", self.privileged_path)));
        argv.push(self.nsenter.clone());
        argv.push(OsString::from("--net"));
        argv.push(OsString::from("--target"));
        argv.push(OsString::from(request.target_pid().to_string()));
        argv.extend(self.courier.iter().cloned());
        argv.extend(request.courier_args());
        argv
    }
}

impl CourierLauncher for NsenterLauncher {
    fn launch(&self, request: &CourierRequest, channel: OwnedFd) -> io::Result<Child> {
        let argv = self.argv(request);
        let mut parts = argv.iter();
        let program = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty courier command"))?;
        let mut command = Command::new(program);
        command
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::from(channel))
            .stderr(Stdio::inherit());
        debug!(
            target: HANDOFF_TARGET,
            target_pid = request.target_pid(),
            count = request.count(),
            "starting namespace courier"
        );
        command.spawn()
    }
}

/// Where and how long the orchestrator waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSettings {
    rendezvous_dir: PathBuf,
    timeout: Duration,
}

impl HandoffSettings {
    /// Rendezvous channels are created under `rendezvous_dir`; every wait is
    /// bounded by `timeout`.
    #[must_use]
    pub fn new(rendezvous_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            rendezvous_dir: rendezvous_dir.into(),
            timeout,
        }
    }

    /// Parent directory of rendezvous channels.
    #[must_use]
    pub fn rendezvous_dir(&self) -> &Path {
        &self.rendezvous_dir
    }

    /// Bound on each wait.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A stream socket created inside another network namespace.
///
/// The socket is neither bound nor listening when it arrives.
#[derive(Debug)]
pub struct HandoffSocket(Socket);

impl HandoffSocket {
    /// Binds the socket to `127.0.0.1:port` in its namespace.
    ///
    /// # Errors
    ///
    /// Returns the bind failure.
    pub fn bind_loopback(&self, port: u16) -> io::Result<()> {
        let address = SockAddr::from(std::net::SocketAddr::from(([127, 0, 0, 1], port)));
        self.0.bind(&address)
    }

    /// Reports whether someone has called `listen` on the socket.
    ///
    /// # Errors
    ///
    /// Returns the `getsockopt` failure.
    pub fn is_listening(&self) -> io::Result<bool> {
        getsockopt(&self.0, sockopt::AcceptConn).map_err(io::Error::from)
    }

    /// Borrows the underlying socket.
    #[must_use]
    pub const fn as_socket(&self) -> &Socket {
        &self.0
    }

    /// Releases the underlying socket.
    #[must_use]
    pub fn into_socket(self) -> Socket {
        self.0
    }
}

impl From<OwnedFd> for HandoffSocket {
    fn from(fd: OwnedFd) -> Self {
        Self(Socket::from(fd))
    }
}

impl AsFd for HandoffSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for HandoffSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Obtains `count` stream sockets created in the network namespace of
/// `target_pid`.
///
/// A count of zero returns immediately without starting a courier.
///
/// # Errors
///
/// Returns a [`HandoffError`] when the courier cannot start, a wait exceeds
/// the configured timeout, the batch size differs from `count`, or the
/// courier exits unsuccessfully. No sockets are returned on failure.
pub fn create_sockets_in_netns(
    target_pid: u32,
    count: usize,
    launcher: &dyn CourierLauncher,
    settings: &HandoffSettings,
) -> Result<Vec<HandoffSocket>, HandoffError> {
    if count == 0 {
        debug!(target: HANDOFF_TARGET, target_pid, "no sockets requested");
        return Ok(Vec::new());
    }

    let request = CourierRequest::new(target_pid, count, settings.timeout());
    let (rendezvous, channel) = Rendezvous::open(settings.rendezvous_dir())?;
    let child = launcher
        .launch(&request, channel)
        .map_err(|source| HandoffError::HelperSpawn {
            source: Arc::new(source),
        })?;
    let mut courier = CourierGuard::new(child);

    let descriptors = rendezvous.receive(count, settings.timeout())?;
    let status = courier.wait(settings.timeout())?;
    if !status.success() {
        return Err(HandoffError::HelperFailed { status });
    }

    info!(
        target: HANDOFF_TARGET,
        target_pid,
        count,
        "sockets handed over from namespace"
    );
    Ok(descriptors.into_iter().map(HandoffSocket::from).collect())
}

/// Kills the courier unless it has been waited for.
struct CourierGuard {
    child: Option<Child>,
}

impl CourierGuard {
    const fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    fn wait(&mut self, timeout: Duration) -> Result<ExitStatus, HandoffError> {
        let Some(child) = self.child.as_mut() else {
            return Err(HandoffError::io(
                HandoffStage::HelperExit,
                io::Error::other("courier already reaped"),
            ));
        };
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.child = None;
                    debug!(target: HANDOFF_TARGET, %status, "namespace courier exited");
                    return Ok(status);
                }
                Ok(None) if start.elapsed() > timeout => {
                    return Err(HandoffError::Timeout {
                        stage: HandoffStage::HelperExit,
                        timeout,
                    });
                }
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(error) => return Err(HandoffError::io(HandoffStage::HelperExit, error)),
            }
        }
    }
}

impl Drop for CourierGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        if let Err(error) = child.kill() {
            warn!(target: HANDOFF_TARGET, pid, %error, "failed to kill namespace courier");
        }
        if let Err(error) = child.wait() {
            warn!(target: HANDOFF_TARGET, pid, %error, "failed to reap namespace courier");
        }
    }
}
