//! Cross-namespace socket handoff and repo server supervision.
//!
//! Build steps inside an isolated container reach package repositories over
//! loopback. The servers behind those ports run on the host, so their
//! listening sockets have to be created inside the container's network
//! namespace and carried out. This crate does that in two halves:
//!
//! - [`create_sockets_in_netns`] starts a courier in the target namespace via
//!   a [`CourierLauncher`]. The courier runs [`send_socket_batch`], which
//!   hands every requested socket back in one `SCM_RIGHTS` message.
//! - [`serve_repos`] reads the snapshot's [`REPO_SERVER_PORTS_FILE`], obtains
//!   one socket per port, binds each to loopback, and starts a repo server on
//!   it, returning a [`RepoServerFleet`] that stops the servers in reverse
//!   order when dropped.
//!
//! [`send_descriptor_batch`] and [`receive_descriptor_batch`] carry
//! descriptors the caller already owns over the same kind of channel.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use netns_handoff::{HandoffSettings, NsenterLauncher, RepoServerSettings, serve_repos};
//!
//! let launcher = NsenterLauncher::new(["/usr/bin/nspawn-run", "send-sockets"]);
//! let handoff = HandoffSettings::new("/run/user/1000/nspawn-run/handoff", Duration::from_secs(3));
//! let settings = RepoServerSettings::new("repo-server", "/var/snapshots/current");
//! let fleet = serve_repos(4242, &launcher, &handoff, &settings)?;
//! assert_eq!(fleet.len(), fleet.ports().len());
//! # Ok::<(), netns_handoff::SupervisorError>(())
//! ```

mod courier;
mod error;
mod handoff;
mod rendezvous;
mod supervisor;

#[cfg(test)]
mod tests;

pub use courier::{send_descriptor_batch, send_socket_batch};
pub use error::{HandoffError, HandoffStage, SupervisorError};
pub use handoff::{
    COURIER_CHANNEL_FD, CourierLauncher, CourierRequest, HandoffSettings, HandoffSocket,
    NsenterLauncher, create_sockets_in_netns,
};
pub use rendezvous::{Rendezvous, receive_descriptor_batch};
pub use supervisor::{
    REPO_SERVER_PORTS_FILE, RepoServer, RepoServerFleet, RepoServerSettings, launch_repo_servers,
    read_repo_server_ports, serve_repos,
};

/// Tracing target for the handoff protocol.
pub const HANDOFF_TARGET: &str = "netns_handoff::handoff";

/// Tracing target for repo server supervision.
pub const SUPERVISOR_TARGET: &str = "netns_handoff::supervisor";

/// Bytes accompanying the descriptor batch.
pub(crate) const HANDOFF_PAYLOAD: &[u8] = b"ohai";
