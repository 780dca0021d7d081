//! Errors raised by the socket handoff and the repo server supervisor.
//!
//! I/O errors are wrapped in `Arc` so both enums stay small enough for the
//! `result_large_err` lint.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The step of the handoff that a failure interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStage {
    /// The courier waiting for the orchestrator to connect.
    Accept,
    /// The orchestrator connecting to the rendezvous channel.
    Connect,
    /// The orchestrator waiting for the descriptor batch.
    Receive,
    /// The courier sending the descriptor batch.
    Send,
    /// The orchestrator waiting for the courier process to exit.
    HelperExit,
}

impl fmt::Display for HandoffStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Accept => "accepting the rendezvous connection",
            Self::Connect => "connecting to the rendezvous channel",
            Self::Receive => "receiving the descriptor batch",
            Self::Send => "sending the descriptor batch",
            Self::HelperExit => "waiting for the courier to exit",
        };
        f.write_str(label)
    }
}

/// Failures of the cross-namespace socket handoff.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The rendezvous directory or socket could not be created.
    #[error("failed to open rendezvous channel under '{path}': {source}")]
    Rendezvous {
        /// Directory or socket path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The courier process could not be started.
    #[error("failed to start the namespace courier: {source}")]
    HelperSpawn {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A bounded wait expired.
    #[error("timed out after {timeout:?} while {stage}")]
    Timeout {
        /// Wait that expired.
        stage: HandoffStage,
        /// Configured bound.
        timeout: Duration,
    },

    /// A socket operation failed outright.
    #[error("socket error while {stage}: {source}")]
    Io {
        /// Step that failed.
        stage: HandoffStage,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The kernel dropped part of the ancillary data.
    #[error("descriptor batch of {expected} was truncated in transit")]
    Truncated {
        /// Number of descriptors requested.
        expected: usize,
    },

    /// The batch held a different number of descriptors than requested.
    #[error("expected {expected} descriptors, received {received}")]
    CountMismatch {
        /// Number of descriptors requested.
        expected: usize,
        /// Number of descriptors that arrived.
        received: usize,
    },

    /// The courier exited unsuccessfully.
    #[error("namespace courier exited with {status}")]
    HelperFailed {
        /// Exit status reported by the courier.
        status: ExitStatus,
    },

    /// The courier could not create the requested sockets.
    #[error("failed to create stream socket: {source}")]
    SocketCreation {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl HandoffError {
    pub(crate) fn io(stage: HandoffStage, source: io::Error) -> Self {
        Self::Io {
            stage,
            source: Arc::new(source),
        }
    }

    /// Maps an I/O error into a timeout when the wait expired.
    pub(crate) fn from_wait(stage: HandoffStage, timeout: Duration, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout { stage, timeout },
            _ => Self::io(stage, source),
        }
    }

    /// Reports whether the failure was an expired wait.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failures while starting or supervising repo servers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The port list could not be read.
    #[error("failed to read repo server ports from '{path}': {source}")]
    PortsFile {
        /// Port list path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The port list held something other than a TCP port.
    #[error("invalid repo server port '{value}' in '{path}'")]
    MalformedPort {
        /// Port list path.
        path: PathBuf,
        /// Offending token.
        value: String,
    },

    /// The socket handoff failed.
    #[error(transparent)]
    Handoff(#[from] HandoffError),

    /// Sockets and ports did not pair up.
    #[error("received {sockets} sockets for {ports} ports")]
    PortCount {
        /// Sockets available.
        sockets: usize,
        /// Ports requested.
        ports: usize,
    },

    /// Binding a socket to its loopback port failed.
    #[error("failed to bind repo server socket to 127.0.0.1:{port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The repo server process could not be started.
    #[error("failed to start repo server '{program}' for port {port}: {source}")]
    Spawn {
        /// Port the server was meant to serve.
        port: u16,
        /// Server executable.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The repo server exited before its socket started listening.
    #[error("repo server for port {port} exited with {status} before listening")]
    ServerExited {
        /// Port the server was meant to serve.
        port: u16,
        /// Exit status of the server.
        status: ExitStatus,
    },

    /// Checking the socket or the server process failed.
    #[error("failed to check repo server readiness for port {port}: {source}")]
    Readiness {
        /// Port being checked.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}
