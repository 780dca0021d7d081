//! Immutable sandbox options and their validating builders.
//!
//! Production call sites build a [`SandboxConfig`] through
//! [`SandboxConfig::builder`]. Knobs that weaken isolation live on
//! [`DebugOptions`], which can only be populated through
//! [`DebugOptions::not_for_production`] and attached through the equally
//! explicit [`SandboxConfigBuilder::debug_options_not_for_production`].

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::unistd::User;

use crate::error::ConfigurationError;
use crate::snapshot::Subvolume;

/// First guest descriptor used for forwarded host descriptors.
pub const FORWARDED_FD_BASE: RawFd = 3;

/// Host path exposed at a container path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    source: PathBuf,
    destination: PathBuf,
}

impl BindMount {
    /// Pairs a host `source` with a container `destination`.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Host side of the mount.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Container side of the mount.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

/// Whether the container runs on a throwaway clone of its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Run on a fresh copy-on-write snapshot.
    #[default]
    Ephemeral,
    /// Run directly on the layer. Writes persist.
    Disabled,
}

/// A single `KEY=VALUE` environment assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAssignment {
    key: String,
    value: String,
}

impl EnvAssignment {
    /// Creates an assignment. Fails when `key` is empty or contains `=`.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || key.contains('=') {
            return Err(ConfigurationError::MalformedAssignment(format!("{key}={value}")));
        }
        Ok(Self { key, value })
    }

    /// Variable name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Variable value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl FromStr for EnvAssignment {
    type Err = ConfigurationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| ConfigurationError::MalformedAssignment(raw.to_owned()))?;
        Self::new(key, value).map_err(|_| ConfigurationError::MalformedAssignment(raw.to_owned()))
    }
}

impl fmt::Display for EnvAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Account the guest command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    name: String,
    uid: u32,
    gid: u32,
}

impl TargetUser {
    /// Describes an account without consulting the passwd database.
    #[must_use]
    pub fn new(name: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
        }
    }

    /// The unprivileged `nobody` account (65534:65534).
    #[must_use]
    pub fn nobody() -> Self {
        Self::new("nobody", 65_534, 65_534)
    }

    /// The superuser.
    #[must_use]
    pub fn root() -> Self {
        Self::new("root", 0, 0)
    }

    /// Resolves `name` through the host passwd database.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::UnknownUser`] when no such account
    /// exists, or [`ConfigurationError::UserLookup`] when the lookup itself
    /// fails.
    pub fn lookup(name: &str) -> Result<Self, ConfigurationError> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(Self::from_passwd(&user)),
            Ok(None) => Err(ConfigurationError::UnknownUser {
                name: name.to_owned(),
            }),
            Err(errno) => Err(ConfigurationError::UserLookup {
                name: name.to_owned(),
                reason: errno.desc().to_owned(),
            }),
        }
    }

    fn from_passwd(user: &User) -> Self {
        Self::new(user.name.clone(), user.uid.as_raw(), user.gid.as_raw())
    }

    /// Account name passed to `--user=`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric user id.
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Numeric primary group id.
    #[must_use]
    pub fn gid(&self) -> u32 {
        self.gid
    }
}

impl Default for TargetUser {
    fn default() -> Self {
        Self::nobody()
    }
}

/// Knobs that weaken isolation or reproducibility.
///
/// The default value is the production setting for every field. Non-default
/// values are only reachable through [`DebugOptions::not_for_production`],
/// which keeps overriding call sites easy to find in review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugOptions {
    forward_tls_env: bool,
    logs_tmpfs: bool,
    snapshot_into: Option<PathBuf>,
    cap_net_admin: bool,
    share_host_network: bool,
    verbose: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            forward_tls_env: false,
            logs_tmpfs: true,
            snapshot_into: None,
            cap_net_admin: false,
            share_host_network: false,
            verbose: false,
        }
    }
}

impl DebugOptions {
    /// Starts overriding the production defaults.
    #[must_use]
    pub fn not_for_production() -> DebugOptionsBuilder {
        DebugOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Whether `THRIFT_TLS_*` host variables are copied into the guest.
    #[must_use]
    pub fn forward_tls_env(&self) -> bool {
        self.forward_tls_env
    }

    /// Whether `/logs` is backed by a tmpfs owned by the target user.
    #[must_use]
    pub fn logs_tmpfs(&self) -> bool {
        self.logs_tmpfs
    }

    /// Destination for a snapshot that outlives the container.
    #[must_use]
    pub fn snapshot_into(&self) -> Option<&Path> {
        self.snapshot_into.as_deref()
    }

    /// Whether the guest receives `CAP_NET_ADMIN`.
    #[must_use]
    pub fn cap_net_admin(&self) -> bool {
        self.cap_net_admin
    }

    /// Whether the guest gets its own network namespace.
    #[must_use]
    pub fn private_network(&self) -> bool {
        !self.share_host_network
    }

    /// Whether verbose diagnostics were requested.
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

/// Builder for [`DebugOptions`]; see [`DebugOptions::not_for_production`].
#[derive(Debug, Clone)]
pub struct DebugOptionsBuilder {
    options: DebugOptions,
}

impl DebugOptionsBuilder {
    /// Copies `THRIFT_TLS_*` host variables into the guest environment.
    #[must_use]
    pub fn forward_tls_env(mut self) -> Self {
        self.options.forward_tls_env = true;
        self
    }

    /// Leaves `/logs` as whatever the layer provides.
    #[must_use]
    pub fn without_logs_tmpfs(mut self) -> Self {
        self.options.logs_tmpfs = false;
        self
    }

    /// Keeps the container snapshot at `path` after exit.
    #[must_use]
    pub fn snapshot_into(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.snapshot_into = Some(path.into());
        self
    }

    /// Grants `CAP_NET_ADMIN` to the guest.
    #[must_use]
    pub fn cap_net_admin(mut self) -> Self {
        self.options.cap_net_admin = true;
        self
    }

    /// Runs the guest in the host network namespace.
    #[must_use]
    pub fn share_host_network(mut self) -> Self {
        self.options.share_host_network = true;
        self
    }

    /// Enables verbose diagnostics.
    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.options.verbose = true;
        self
    }

    /// Finishes the override set.
    #[must_use]
    pub fn build(self) -> DebugOptions {
        self.options
    }
}

/// Validated description of one isolated execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    command: Vec<OsString>,
    layer: Subvolume,
    bind_repo_ro: bool,
    bindmount_ro: Vec<BindMount>,
    bindmount_rw: Vec<BindMount>,
    forward_fd: Vec<RawFd>,
    hostname: Option<String>,
    quiet: bool,
    allow_mknod: bool,
    snapshot: SnapshotMode,
    setenv: Vec<EnvAssignment>,
    user: TargetUser,
    debug: DebugOptions,
}

impl SandboxConfig {
    /// Starts a configuration running `command` on `layer`.
    #[must_use]
    pub fn builder<I, S>(layer: Subvolume, command: I) -> SandboxConfigBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        SandboxConfigBuilder {
            config: Self {
                command: command.into_iter().map(Into::into).collect(),
                layer,
                bind_repo_ro: false,
                bindmount_ro: Vec::new(),
                bindmount_rw: Vec::new(),
                forward_fd: Vec::new(),
                hostname: None,
                quiet: false,
                allow_mknod: false,
                snapshot: SnapshotMode::default(),
                setenv: Vec::new(),
                user: TargetUser::default(),
                debug: DebugOptions::default(),
            },
            pending_error: None,
        }
    }

    /// Guest argument vector.
    #[must_use]
    pub fn command(&self) -> &[OsString] {
        &self.command
    }

    /// Source layer.
    #[must_use]
    pub fn layer(&self) -> &Subvolume {
        &self.layer
    }

    /// Whether the repository root is bound read-only regardless of metadata.
    #[must_use]
    pub fn bind_repo_ro(&self) -> bool {
        self.bind_repo_ro
    }

    /// Read-only bind mounts, in declaration order.
    #[must_use]
    pub fn bindmount_ro(&self) -> &[BindMount] {
        &self.bindmount_ro
    }

    /// Read-write bind mounts, in declaration order.
    #[must_use]
    pub fn bindmount_rw(&self) -> &[BindMount] {
        &self.bindmount_rw
    }

    /// Host descriptors, mapped to guest descriptors from [`FORWARDED_FD_BASE`].
    #[must_use]
    pub fn forward_fd(&self) -> &[RawFd] {
        &self.forward_fd
    }

    /// Container hostname, if set.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Whether runtime chatter is suppressed.
    #[must_use]
    pub fn quiet(&self) -> bool {
        self.quiet
    }

    /// Whether the guest keeps `CAP_MKNOD`.
    #[must_use]
    pub fn allow_mknod(&self) -> bool {
        self.allow_mknod
    }

    /// Snapshot mode.
    #[must_use]
    pub fn snapshot(&self) -> SnapshotMode {
        self.snapshot
    }

    /// Explicit guest environment, in declaration order.
    #[must_use]
    pub fn setenv(&self) -> &[EnvAssignment] {
        &self.setenv
    }

    /// Account the guest command runs as.
    #[must_use]
    pub fn user(&self) -> &TargetUser {
        &self.user
    }

    /// Debug-only knobs.
    #[must_use]
    pub fn debug_options(&self) -> &DebugOptions {
        &self.debug
    }
}

/// Builder for [`SandboxConfig`]. Validation happens once, in [`Self::build`].
#[derive(Debug, Clone)]
#[must_use]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
    pending_error: Option<ConfigurationError>,
}

impl SandboxConfigBuilder {
    /// Always binds the repository root read-only.
    pub fn bind_repo_ro(mut self) -> Self {
        self.config.bind_repo_ro = true;
        self
    }

    /// Adds a read-only bind mount.
    pub fn bindmount_ro(
        mut self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        self.config.bindmount_ro.push(BindMount::new(source, destination));
        self
    }

    /// Adds a read-write bind mount.
    pub fn bindmount_rw(
        mut self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        self.config.bindmount_rw.push(BindMount::new(source, destination));
        self
    }

    /// Forwards a host descriptor to the next free guest descriptor.
    pub fn forward_fd(mut self, fd: RawFd) -> Self {
        self.config.forward_fd.push(fd);
        self
    }

    /// Sets the container hostname.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = Some(hostname.into());
        self
    }

    /// Suppresses runtime status output.
    pub fn quiet(mut self) -> Self {
        self.config.quiet = true;
        self
    }

    /// Lets the guest create device nodes.
    pub fn allow_mknod(mut self) -> Self {
        self.config.allow_mknod = true;
        self
    }

    /// Runs directly on the layer instead of a snapshot.
    pub fn without_snapshot(mut self) -> Self {
        self.config.snapshot = SnapshotMode::Disabled;
        self
    }

    /// Adds a guest environment assignment.
    pub fn setenv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match EnvAssignment::new(key, value) {
            Ok(assignment) => self.config.setenv.push(assignment),
            Err(error) => {
                self.pending_error.get_or_insert(error);
            }
        }
        self
    }

    /// Adds an already-parsed guest environment assignment.
    pub fn setenv_assignment(mut self, assignment: EnvAssignment) -> Self {
        self.config.setenv.push(assignment);
        self
    }

    /// Runs the guest command as `user`.
    pub fn user(mut self, user: TargetUser) -> Self {
        self.config.user = user;
        self
    }

    /// Replaces the production-safe debug defaults.
    pub fn debug_options_not_for_production(mut self, debug: DebugOptions) -> Self {
        self.config.debug = debug;
        self
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an empty command, `quiet` with
    /// verbose debugging, a persisted snapshot without snapshot mode, a
    /// descriptor forwarded twice, or a malformed environment assignment.
    pub fn build(self) -> Result<SandboxConfig, ConfigurationError> {
        if let Some(error) = self.pending_error {
            return Err(error);
        }
        let config = self.config;
        if config.command.is_empty() {
            return Err(ConfigurationError::EmptyCommand);
        }
        if config.quiet && config.debug.verbose {
            return Err(ConfigurationError::QuietWithVerbose);
        }
        if let Some(path) = config.debug.snapshot_into.as_ref()
            && config.snapshot == SnapshotMode::Disabled
        {
            return Err(ConfigurationError::PersistWithoutSnapshot { path: path.clone() });
        }
        let mut seen = BTreeSet::new();
        if let Some(fd) = config.forward_fd.iter().find(|fd| !seen.insert(**fd)) {
            return Err(ConfigurationError::DuplicateForwardedFd { fd: *fd });
        }
        Ok(config)
    }
}
