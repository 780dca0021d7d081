//! Shared fixtures: an in-process courier and scripted repo servers.

use std::fs;
use std::io;
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};

use crate::courier::send_socket_batch;
use crate::handoff::{CourierLauncher, CourierRequest, HandoffSocket};

/// Runs the courier on a thread and stands in a shell for its process.
#[derive(Debug, Clone, Default)]
pub(super) struct ThreadCourier {
    pub(super) send_only: Option<usize>,
    pub(super) exit_code: i32,
    pub(super) silent: bool,
}

impl CourierLauncher for ThreadCourier {
    fn launch(&self, request: &CourierRequest, channel: OwnedFd) -> io::Result<Child> {
        if self.silent {
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(2));
                drop(channel);
            });
            return Command::new("/bin/sh").args(["-c", "exec sleep 5"]).spawn();
        }
        let count = self.send_only.unwrap_or_else(|| request.count());
        let timeout = request.timeout();
        thread::spawn(move || drop(send_socket_batch(channel, count, timeout)));
        Command::new("/bin/sh")
            .arg("-c")
            .arg(format!("exit {}", self.exit_code))
            .spawn()
    }
}

/// A loopback port that was free a moment ago.
pub(super) fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Fresh unbound IPv4 stream sockets standing in for a handed-over batch.
pub(super) fn local_sockets(count: usize) -> Vec<HandoffSocket> {
    (0..count)
        .map(|_| {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, None).expect("socket");
            HandoffSocket::from(OwnedFd::from(socket))
        })
        .collect()
}

/// Calls `listen` on a duplicate of `socket` once the supervisor has bound
/// it, which is what a real repo server would do with its inherited copy.
pub(super) fn listen_once_bound(socket: &HandoffSocket) {
    listen_once_bound_and(socket, None);
}

/// Like [`listen_once_bound`], but also waits for `gate` to exist.
pub(super) fn listen_once_bound_and(socket: &HandoffSocket, gate: Option<PathBuf>) {
    let duplicate = socket.as_socket().try_clone().expect("duplicate socket");
    thread::spawn(move || {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            let bound = duplicate
                .local_addr()
                .ok()
                .and_then(|address| address.as_socket())
                .is_some_and(|address| address.port() != 0);
            let opened = gate.as_deref().is_none_or(Path::exists);
            if bound && opened {
                drop(duplicate.listen(16));
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    });
}

/// Writes an executable shell script standing in for the repo server.
pub(super) fn server_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write server script");
    let mut permissions = fs::metadata(&path).expect("script metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("chmod server script");
    path
}

/// Reports whether a process with `pid` still exists.
pub(super) fn process_exists(pid: u32) -> bool {
    let raw = i32::try_from(pid).expect("pid fits in i32");
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
}
