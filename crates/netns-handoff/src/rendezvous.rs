//! Orchestrator side of the rendezvous channel.
//!
//! A fresh directory under the scratch area holds one listening Unix socket.
//! The listening descriptor is handed to the courier; the orchestrator keeps
//! only the path, connects once, and reads the whole batch from a single
//! message.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use socket2::{Domain, SockAddr, Socket, Type};
use tempfile::TempDir;
use tracing::debug;

use crate::HANDOFF_TARGET;
use crate::error::{HandoffError, HandoffStage};

const RENDEZVOUS_SOCKET: &str = "rendezvous.sock";
const MIN_WAIT: Duration = Duration::from_millis(1);

/// A bound rendezvous path awaiting the courier.
#[derive(Debug)]
pub struct Rendezvous {
    _dir: TempDir,
    path: PathBuf,
}

impl Rendezvous {
    /// Creates a private directory under `parent` and listens inside it.
    ///
    /// Returns the rendezvous and the listening descriptor for the courier.
    /// The orchestrator does not keep a copy of the listener, so a courier
    /// that dies early surfaces as a refused connection.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Rendezvous`] when the directory or socket
    /// cannot be created.
    pub fn open(parent: &Path) -> Result<(Self, OwnedFd), HandoffError> {
        let dir = tempfile::Builder::new()
            .prefix("handoff-")
            .tempdir_in(parent)
            .map_err(|source| HandoffError::Rendezvous {
                path: parent.to_path_buf(),
                source: Arc::new(source),
            })?;
        let path = dir.path().join(RENDEZVOUS_SOCKET);
        let listener = UnixListener::bind(&path).map_err(|source| HandoffError::Rendezvous {
            path: path.clone(),
            source: Arc::new(source),
        })?;
        debug!(
            target: HANDOFF_TARGET,
            path = %path.display(),
            "rendezvous channel listening"
        );
        Ok((Self { _dir: dir, path }, OwnedFd::from(listener)))
    }

    /// Socket path of the channel.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connects to the courier and receives exactly `expected` descriptors.
    ///
    /// Connecting and receiving are each bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Timeout`] when a wait expires,
    /// [`HandoffError::CountMismatch`] when the batch has the wrong size, and
    /// [`HandoffError::Truncated`] when the kernel dropped ancillary data.
    pub fn receive(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<OwnedFd>, HandoffError> {
        receive_descriptor_batch(&self.path, expected, timeout)
    }
}

/// Connects to the rendezvous socket at `path` and receives exactly
/// `expected` descriptors.
///
/// This is the receiving half for a process that did not create the
/// [`Rendezvous`] and only knows its path. Received descriptors are
/// close-on-exec.
///
/// # Errors
///
/// Fails like [`Rendezvous::receive`].
pub fn receive_descriptor_batch(
    path: &Path,
    expected: usize,
    timeout: Duration,
) -> Result<Vec<OwnedFd>, HandoffError> {
    let wait = timeout.max(MIN_WAIT);
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .map_err(|source| HandoffError::io(HandoffStage::Connect, source))?;
    let address =
        SockAddr::unix(path).map_err(|source| HandoffError::io(HandoffStage::Connect, source))?;
    socket
        .connect_timeout(&address, wait)
        .map_err(|source| HandoffError::from_wait(HandoffStage::Connect, timeout, source))?;
    socket
        .set_read_timeout(Some(wait))
        .map_err(|source| HandoffError::io(HandoffStage::Receive, source))?;
    receive_batch(&socket, expected, timeout)
}

struct Received {
    bytes: usize,
    truncated: bool,
    descriptors: Vec<OwnedFd>,
}

/// Reads one message and checks that it carries exactly `expected` descriptors.
fn receive_batch(
    socket: &Socket,
    expected: usize,
    timeout: Duration,
) -> Result<Vec<OwnedFd>, HandoffError> {
    let capacity = control_capacity(expected).ok_or_else(|| {
        HandoffError::io(
            HandoffStage::Receive,
            io::Error::new(io::ErrorKind::InvalidInput, "descriptor batch too large"),
        )
    })?;
    let mut payload = [0_u8; 16];
    let mut control = vec![0_u8; capacity];
    let received = loop {
        match receive_once(socket.as_raw_fd(), &mut payload, &mut control) {
            Ok(received) => break received,
            Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) => {
                return Err(HandoffError::Timeout {
                    stage: HandoffStage::Receive,
                    timeout,
                });
            }
            Err(errno) => {
                return Err(HandoffError::io(HandoffStage::Receive, io::Error::from(errno)));
            }
        }
    };

    if received.truncated {
        return Err(HandoffError::Truncated { expected });
    }
    let count = received.descriptors.len();
    if count != expected {
        return Err(HandoffError::CountMismatch {
            expected,
            received: count,
        });
    }
    debug!(
        target: HANDOFF_TARGET,
        descriptors = count,
        bytes = received.bytes,
        "descriptor batch received"
    );
    Ok(received.descriptors)
}

fn receive_once(fd: RawFd, payload: &mut [u8], control: &mut Vec<u8>) -> nix::Result<Received> {
    let mut iov = [io::IoSliceMut::new(payload)];
    let message = recvmsg::<()>(fd, &mut iov, Some(control), MsgFlags::MSG_CMSG_CLOEXEC)?;
    let mut descriptors = Vec::new();
    for cmsg in message.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            // The kernel installed these descriptors in this process; nothing
            // else owns them yet.
            descriptors.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    Ok(Received {
        bytes: message.bytes,
        truncated: message.flags.contains(MsgFlags::MSG_CTRUNC),
        descriptors,
    })
}

/// Room for one descriptor more than expected so a surplus shows up as a
/// count mismatch rather than truncation.
fn control_capacity(expected: usize) -> Option<usize> {
    let bytes = expected
        .checked_add(1)?
        .checked_mul(mem::size_of::<RawFd>())?;
    let length = u32::try_from(bytes).ok()?;
    // SAFETY: `CMSG_SPACE` only performs arithmetic on its argument.
    usize::try_from(unsafe { libc::CMSG_SPACE(length) }).ok()
}
