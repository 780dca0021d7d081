//! Starts one repo server per handed-over socket and waits for readiness.
//!
//! Each socket is bound to `127.0.0.1:<port>` inside its namespace and passed
//! to a freshly started server, which is expected to call `listen` on it. The
//! supervisor never listens itself; it polls `SO_ACCEPTCONN` on its own copy
//! of the socket. A listen backlog only shows that the server reached
//! `listen`, not that it is serving, so readiness is an approximation.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tracing::{debug, info, warn};

use crate::SUPERVISOR_TARGET;
use crate::error::SupervisorError;
use crate::handoff::{CourierLauncher, HandoffSettings, HandoffSocket, create_sockets_in_netns};

/// File inside a snapshot listing the ports its repo servers should serve.
pub const REPO_SERVER_PORTS_FILE: &str = "repo_server_ports";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reads the de-duplicated repo server ports of `snapshot_dir`, ascending.
///
/// # Errors
///
/// Returns [`SupervisorError::PortsFile`] when the list cannot be read and
/// [`SupervisorError::MalformedPort`] when an entry is not a TCP port.
pub fn read_repo_server_ports(snapshot_dir: &Path) -> Result<Vec<u16>, SupervisorError> {
    let path = snapshot_dir.join(REPO_SERVER_PORTS_FILE);
    let contents = fs::read_to_string(&path).map_err(|source| SupervisorError::PortsFile {
        path: path.clone(),
        source: Arc::new(source),
    })?;
    let mut ports = BTreeSet::new();
    for token in contents.split_whitespace() {
        let port = token
            .parse::<u16>()
            .map_err(|_| SupervisorError::MalformedPort {
                path: path.clone(),
                value: token.to_owned(),
            })?;
        ports.insert(port);
    }
    Ok(ports.into_iter().collect())
}

/// How repo servers are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoServerSettings {
    binary: PathBuf,
    snapshot_dir: PathBuf,
    debug: bool,
    poll_interval: Duration,
}

impl RepoServerSettings {
    /// Serves `snapshot_dir` with `binary`.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            snapshot_dir: snapshot_dir.into(),
            debug: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Passes `--debug` to every server.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Interval between readiness checks.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Server executable.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Snapshot directory served.
    #[must_use]
    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Arguments for a server handed descriptor `fd`.
    #[must_use]
    pub fn server_args(&self, fd: RawFd) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--socket-fd"),
            OsString::from(fd.to_string()),
            OsString::from("--snapshot-dir"),
            self.snapshot_dir.clone().into_os_string(),
        ];
        if self.debug {
            args.push(OsString::from("--debug"));
        }
        args
    }
}

/// A running repo server and the socket it was handed.
///
/// Dropping it kills and reaps the server.
#[derive(Debug)]
pub struct RepoServer {
    port: u16,
    child: Child,
    socket: HandoffSocket,
}

impl RepoServer {
    /// Loopback port served.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Process id of the server.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Socket shared with the server.
    #[must_use]
    pub const fn socket(&self) -> &HandoffSocket {
        &self.socket
    }
}

impl Drop for RepoServer {
    fn drop(&mut self) {
        let pid = self.child.id();
        if let Err(error) = self.child.kill() {
            warn!(
                target: SUPERVISOR_TARGET,
                pid,
                port = self.port,
                %error,
                "failed to kill repo server"
            );
        }
        match self.child.wait() {
            Ok(status) => info!(
                target: SUPERVISOR_TARGET,
                pid,
                port = self.port,
                %status,
                "repo server stopped"
            ),
            Err(error) => warn!(
                target: SUPERVISOR_TARGET,
                pid,
                port = self.port,
                %error,
                "failed to reap repo server"
            ),
        }
    }
}

/// Repo servers in start order.
///
/// Teardown stops them in reverse start order.
#[derive(Debug, Default)]
pub struct RepoServerFleet {
    servers: Vec<RepoServer>,
}

impl RepoServerFleet {
    /// Running servers in start order.
    #[must_use]
    pub fn servers(&self) -> &[RepoServer] {
        &self.servers
    }

    /// Ports served, in start order.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        self.servers.iter().map(RepoServer::port).collect()
    }

    /// Number of running servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Reports whether no server is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Stops every server, newest first, and returns the ports in stop order.
    #[must_use]
    pub fn shutdown(mut self) -> Vec<u16> {
        self.stop_all()
    }

    fn stop_all(&mut self) -> Vec<u16> {
        let mut stopped = Vec::with_capacity(self.servers.len());
        while let Some(server) = self.servers.pop() {
            stopped.push(server.port());
            drop(server);
        }
        stopped
    }
}

impl Drop for RepoServerFleet {
    fn drop(&mut self) {
        if !self.servers.is_empty() {
            debug!(
                target: SUPERVISOR_TARGET,
                servers = self.servers.len(),
                "tearing down repo servers"
            );
            drop(self.stop_all());
        }
    }
}

/// Starts one server per `(socket, port)` pair, in order, waiting for each
/// to listen before starting the next.
///
/// Servers already started are stopped in reverse order when a later one
/// fails.
///
/// # Errors
///
/// Returns [`SupervisorError::PortCount`] when the lengths differ, and the
/// first bind, spawn, or readiness failure otherwise.
pub fn launch_repo_servers(
    sockets: Vec<HandoffSocket>,
    ports: &[u16],
    settings: &RepoServerSettings,
) -> Result<RepoServerFleet, SupervisorError> {
    if sockets.len() != ports.len() {
        return Err(SupervisorError::PortCount {
            sockets: sockets.len(),
            ports: ports.len(),
        });
    }
    let mut fleet = RepoServerFleet::default();
    for (socket, &port) in sockets.into_iter().zip(ports) {
        let server = start_repo_server(socket, port, settings)?;
        fleet.servers.push(server);
    }
    Ok(fleet)
}

/// Reads the snapshot's ports, obtains sockets from the namespace of
/// `target_pid`, and starts a server for each.
///
/// # Errors
///
/// Returns the first port list, handoff, or server startup failure.
pub fn serve_repos(
    target_pid: u32,
    launcher: &dyn CourierLauncher,
    handoff: &HandoffSettings,
    settings: &RepoServerSettings,
) -> Result<RepoServerFleet, SupervisorError> {
    let ports = read_repo_server_ports(settings.snapshot_dir())?;
    info!(
        target: SUPERVISOR_TARGET,
        target_pid,
        ports = ?ports,
        snapshot = %settings.snapshot_dir().display(),
        "starting repo servers"
    );
    let sockets = create_sockets_in_netns(target_pid, ports.len(), launcher, handoff)?;
    launch_repo_servers(sockets, &ports, settings)
}

fn start_repo_server(
    socket: HandoffSocket,
    port: u16,
    settings: &RepoServerSettings,
) -> Result<RepoServer, SupervisorError> {
    socket
        .bind_loopback(port)
        .map_err(|source| SupervisorError::Bind {
            port,
            source: Arc::new(source),
        })?;

    let fd = socket.as_raw_fd();
    let mut command = Command::new(settings.binary());
    command
        .args(settings.server_args(fd))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    // SAFETY: `fcntl` is async-signal-safe and only touches the descriptor
    // that the server is meant to inherit.
    unsafe {
        command.pre_exec(move || {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                .map(drop)
                .map_err(io::Error::from)
        });
    }
    let child = command.spawn().map_err(|source| SupervisorError::Spawn {
        port,
        program: settings.binary().display().to_string(),
        source: Arc::new(source),
    })?;

    let mut server = RepoServer {
        port,
        child,
        socket,
    };
    debug!(
        target: SUPERVISOR_TARGET,
        pid = server.pid(),
        port,
        fd,
        "repo server started"
    );
    wait_until_listening(&mut server, settings.poll_interval)?;
    Ok(server)
}

fn wait_until_listening(
    server: &mut RepoServer,
    poll_interval: Duration,
) -> Result<(), SupervisorError> {
    let port = server.port;
    loop {
        let listening = server
            .socket
            .is_listening()
            .map_err(|source| SupervisorError::Readiness {
                port,
                source: Arc::new(source),
            })?;
        if listening {
            info!(
                target: SUPERVISOR_TARGET,
                pid = server.pid(),
                port,
                "repo server listening"
            );
            return Ok(());
        }
        let exited = server
            .child
            .try_wait()
            .map_err(|source| SupervisorError::Readiness {
                port,
                source: Arc::new(source),
            })?;
        if let Some(status) = exited {
            return Err(SupervisorError::ServerExited { port, status });
        }
        thread::sleep(poll_interval);
    }
}
