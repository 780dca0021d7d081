//! The hidden `send-sockets` subcommand, run inside the target namespace.

use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use netns_handoff::send_socket_batch;
use nix::fcntl::{FcntlArg, fcntl};
use tracing::debug;

use crate::AppError;
use crate::CLI_TARGET;
use crate::cli::SendSocketsArgs;

/// Hands `args.count` fresh sockets over the inherited rendezvous listener.
pub(crate) fn send_sockets(args: &SendSocketsArgs) -> Result<(), AppError> {
    let fd = args.listen_fd;
    fcntl(fd, FcntlArg::F_GETFD).map_err(|source| AppError::ListenFd { fd, source })?;
    // SAFETY: the descriptor is open and was handed to this process for its
    // exclusive use by whoever spawned it.
    let channel = unsafe { OwnedFd::from_raw_fd(fd) };
    debug!(target: CLI_TARGET, count = args.count, fd, "sending socket batch");
    send_socket_batch(
        channel,
        args.count,
        Duration::from_millis(args.timeout_ms),
    )?;
    Ok(())
}
