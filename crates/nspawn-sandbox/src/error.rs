//! Domain errors raised by the sandbox engine.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::ExitStatus;

use netns_handoff::HandoffError;
use thiserror::Error;

/// Stage of an isolated execution at which a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Option validation, before anything touches the host.
    Configuration,
    /// Cloning, mounting, or deleting the filesystem snapshot.
    Snapshot,
    /// Spawning the isolation runtime.
    Launch,
    /// Waiting for the isolation runtime to exit.
    Wait,
    /// The guest command itself reported failure.
    Command,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Configuration => "configuration",
            Self::Snapshot => "snapshot",
            Self::Launch => "launch",
            Self::Wait => "wait",
            Self::Command => "command",
        };
        f.write_str(label)
    }
}

/// Invalid option combinations, rejected before any process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The guest command was empty.
    #[error("the sandboxed command must contain at least one argument")]
    EmptyCommand,

    /// `quiet` was combined with verbose debug logging.
    #[error("`quiet` cannot be combined with verbose debug logging")]
    QuietWithVerbose,

    /// A persisted snapshot was requested while snapshotting was disabled.
    #[error("persisting a snapshot into {path} requires snapshot mode to be enabled")]
    PersistWithoutSnapshot { path: PathBuf },

    /// An environment assignment lacked `=` or a key.
    #[error("environment assignment '{0}' must have the form KEY=VALUE")]
    MalformedAssignment(String),

    /// The same host descriptor was forwarded twice.
    #[error("descriptor {fd} is forwarded more than once")]
    DuplicateForwardedFd { fd: RawFd },

    /// The target user is not present in the passwd database.
    #[error("user '{name}' does not exist")]
    UnknownUser { name: String },

    /// The passwd database could not be queried.
    #[error("failed to look up user '{name}': {reason}")]
    UserLookup { name: String, reason: String },

    /// The repository bind was required but no repository root was found.
    #[error("the layer requires repository access but no repository root was found")]
    MissingRepoRoot,

    /// Descriptors were forwarded through a privilege wrapper that would
    /// close them, and no receiver was configured to inject them afterwards.
    #[error("forwarding descriptors through a privilege wrapper needs a descriptor receiver")]
    ForwardingNeedsReceiver,
}

/// Failures while acquiring or releasing a filesystem snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The scratch directory could not be prepared.
    #[error("failed to prepare scratch directory {path}: {source}")]
    Scratch { path: PathBuf, source: io::Error },

    /// The snapshot destination already exists.
    #[error("snapshot destination {path} already exists")]
    DestinationExists { path: PathBuf },

    /// The layer has no parent directory to hold a sibling snapshot.
    #[error("layer {layer} has no parent directory for its snapshot")]
    NoSnapshotLocation { layer: PathBuf },

    /// The snapshot destination is not on a btrfs filesystem, so the layer
    /// cannot be cloned there.
    #[error(
        "snapshot directory {path} is not on btrfs; snapshots must share the layer's filesystem"
    )]
    NotBtrfs { path: PathBuf },

    /// An external snapshot tool could not be started.
    #[error("failed to run `{program}` while {action}: {source}")]
    ToolSpawn {
        program: String,
        action: &'static str,
        source: io::Error,
    },

    /// An external snapshot tool exited unsuccessfully.
    #[error("`{program}` exited with {status} while {action}")]
    ToolFailed {
        program: String,
        action: &'static str,
        status: ExitStatus,
    },

    /// The mount table could not be read.
    #[error("failed to read the mount table: {source}")]
    MountTable { source: io::Error },

    /// Layer metadata could not be read.
    #[error("failed to read layer metadata {path}: {source}")]
    Metadata { path: PathBuf, source: io::Error },

    /// Layer metadata held an unexpected value.
    #[error("layer metadata {path} holds '{value}', expected an integer")]
    MalformedMetadata { path: PathBuf, value: String },

    /// A test or alternative store reported a failure of its own.
    #[error("snapshot store failure: {0}")]
    Store(String),
}

/// Errors raised while preparing, running, or tearing down a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The supplied options were rejected.
    #[error("invalid sandbox configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Snapshot acquisition failed.
    #[error("snapshot stage failed: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The isolation runtime could not be spawned.
    #[error("failed to launch `{program}`: {source}")]
    Launch { program: String, source: io::Error },

    /// Forwarded descriptors could not be handed across the privilege
    /// wrapper.
    #[error("failed to inject forwarded descriptors: {0}")]
    Injection(#[from] HandoffError),

    /// Waiting for the isolation runtime failed.
    #[error("failed to wait for sandboxed process {pid}: {source}")]
    Wait { pid: u32, source: io::Error },

    /// The guest command exited unsuccessfully.
    #[error("sandboxed command exited with {status}")]
    CommandFailed {
        status: ExitStatus,
        stdout: Option<Vec<u8>>,
        stderr: Option<Vec<u8>>,
    },
}

impl SandboxError {
    /// Returns the stage at which the failure happened.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Configuration(_) => Stage::Configuration,
            Self::Snapshot(_) => Stage::Snapshot,
            Self::Launch { .. } | Self::Injection(_) => Stage::Launch,
            Self::Wait { .. } => Stage::Wait,
            Self::CommandFailed { .. } => Stage::Command,
        }
    }

    /// True when the guest command failed rather than the engine.
    #[must_use]
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }

    /// Exit code of a failed guest command, when one is available.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { status, .. } => status.code(),
            _ => None,
        }
    }
}
