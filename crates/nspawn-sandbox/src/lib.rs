//! Disposable `systemd-nspawn` containers for build steps.
//!
//! A [`SandboxConfig`] describes one isolated execution: the command, the
//! layer it runs on, bind mounts, environment, and forwarded descriptors. It
//! is validated once and never mutated. Options that weaken isolation sit on
//! [`DebugOptions`] and can only be set through explicitly named
//! constructors.
//!
//! [`resolve_invocation`] turns a configuration into the runtime's argument
//! vector and environments. [`Sandbox`] owns the rest of the lifecycle: it
//! clones the layer through a [`SnapshotStore`] into a hidden sibling of the
//! layer, launches the runtime, and deletes ephemeral snapshots on every exit
//! path once the runtime has exited.
//!
//! ```rust,no_run
//! use nspawn_sandbox::{
//!     BtrfsSnapshotStore, HostContext, PopenArgs, Redirect, RuntimeSettings, Sandbox,
//!     SandboxConfig, Subvolume,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SandboxConfig::builder(Subvolume::new("/layers/base/volume"), ["/bin/true"])
//!     .hostname("build-step")
//!     .build()?;
//!
//! let sandbox = Sandbox::new(
//!     BtrfsSnapshotStore::new(["sudo"]),
//!     RuntimeSettings::new(),
//!     HostContext::detect(),
//! );
//! let outcome = sandbox.run(&config, PopenArgs::default().stdout(Redirect::Piped))?;
//! assert!(outcome.status.success());
//! # Ok(()) }
//! ```

mod environment;
mod error;
mod forward;
mod host;
mod inject;
mod invocation;
mod lifecycle;
mod options;
mod snapshot;

pub use environment::{FORWARDED_ENV_PREFIX, HostEnvironment, RUNTIME_RESERVED_PREFIX};
pub use error::{ConfigurationError, SandboxError, SnapshotError, Stage};
pub use forward::{DescriptorForwarder, SequentialForwarder, listen_fds_trampoline};
pub use host::{HostContext, find_repo_root};
pub use inject::{DescriptorReceiver, receive_and_exec};
pub use invocation::{
    InstanceId, InvocationInputs, ResolvedInvocation, colon_quote, requires_repo,
    resolve_invocation,
};
pub use lifecycle::{
    IsolatedProcess, LifecycleState, PopenArgs, Redirect, RunOutcome, RuntimeSettings, Sandbox,
    SnapshotLease,
};
pub use options::{
    BindMount, DebugOptions, DebugOptionsBuilder, EnvAssignment, FORWARDED_FD_BASE,
    SandboxConfig, SandboxConfigBuilder, SnapshotMode, TargetUser,
};
pub use snapshot::{BtrfsSnapshotStore, LayerMetadata, MetaDirectory, SnapshotStore, Subvolume};

#[cfg(test)]
mod tests;
