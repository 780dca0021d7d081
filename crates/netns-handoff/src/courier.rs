//! Sending side of the handoff.
//!
//! The courier creates the requested IPv4 stream sockets in whatever network
//! namespace it was started in, accepts exactly one connection on the
//! inherited rendezvous listener, and sends every socket in a single
//! `SCM_RIGHTS` message. It keeps no references once it returns.
//!
//! [`send_descriptor_batch`] is the same transfer for descriptors the caller
//! already holds, such as files forwarded into a container.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::error::{HandoffError, HandoffStage};
use crate::{HANDOFF_PAYLOAD, HANDOFF_TARGET};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Creates `count` sockets and sends them over `channel` in one message.
///
/// `channel` must be a listening Unix stream socket. Accepting and sending
/// are each bounded by `timeout`.
///
/// # Errors
///
/// Returns [`HandoffError::SocketCreation`] when a socket cannot be created,
/// [`HandoffError::Timeout`] when nobody connects in time, and
/// [`HandoffError::Io`] when the transfer fails.
pub fn send_socket_batch(
    channel: OwnedFd,
    count: usize,
    timeout: Duration,
) -> Result<(), HandoffError> {
    let sockets = create_stream_sockets(count)?;
    let descriptors: Vec<RawFd> = sockets.iter().map(AsRawFd::as_raw_fd).collect();
    send_descriptor_batch(channel, &descriptors, timeout)
}

/// Sends existing `descriptors` over `channel` in one message.
///
/// `channel` must be a listening Unix stream socket; the peer receives
/// duplicates and the caller keeps its own copies. Accepting and sending are
/// each bounded by `timeout`.
///
/// # Errors
///
/// Returns [`HandoffError::Timeout`] when nobody connects in time and
/// [`HandoffError::Io`] when the transfer fails.
pub fn send_descriptor_batch(
    channel: OwnedFd,
    descriptors: &[RawFd],
    timeout: Duration,
) -> Result<(), HandoffError> {
    let listener = Socket::from(channel);
    let stream = accept_with_timeout(&listener, timeout)?;
    send_descriptors(&stream, descriptors, timeout)?;
    debug!(
        target: HANDOFF_TARGET,
        count = descriptors.len(),
        "descriptor batch sent"
    );
    Ok(())
}

fn create_stream_sockets(count: usize) -> Result<Vec<Socket>, HandoffError> {
    (0..count)
        .map(|_| {
            Socket::new(Domain::IPV4, Type::STREAM, None).map_err(|source| {
                HandoffError::SocketCreation {
                    source: source.into(),
                }
            })
        })
        .collect()
}

fn accept_with_timeout(listener: &Socket, timeout: Duration) -> Result<Socket, HandoffError> {
    listener
        .set_nonblocking(true)
        .map_err(|source| HandoffError::io(HandoffStage::Accept, source))?;
    let start = Instant::now();
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let write_timeout = timeout.max(ACCEPT_POLL_INTERVAL);
                stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_write_timeout(Some(write_timeout)))
                    .map_err(|source| HandoffError::io(HandoffStage::Send, source))?;
                return Ok(stream);
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                if start.elapsed() > timeout {
                    return Err(HandoffError::Timeout {
                        stage: HandoffStage::Accept,
                        timeout,
                    });
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) => return Err(HandoffError::io(HandoffStage::Accept, error)),
        }
    }
}

fn send_descriptors(
    stream: &Socket,
    descriptors: &[RawFd],
    timeout: Duration,
) -> Result<(), HandoffError> {
    let payload = [io::IoSlice::new(HANDOFF_PAYLOAD)];
    let rights = [ControlMessage::ScmRights(descriptors)];
    let control: &[ControlMessage<'_>] = if descriptors.is_empty() { &[] } else { &rights };
    loop {
        match sendmsg::<()>(stream.as_raw_fd(), &payload, control, MsgFlags::empty(), None) {
            Ok(sent) if sent == HANDOFF_PAYLOAD.len() => return Ok(()),
            Ok(sent) => {
                return Err(HandoffError::io(
                    HandoffStage::Send,
                    io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write of {sent} bytes"),
                    ),
                ));
            }
            Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) => {
                return Err(HandoffError::Timeout {
                    stage: HandoffStage::Send,
                    timeout,
                });
            }
            Err(errno) => return Err(HandoffError::io(HandoffStage::Send, io::Error::from(errno))),
        }
    }
}
