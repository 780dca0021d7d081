//! Translation of a [`SandboxConfig`] into a concrete runtime invocation.
//!
//! [`resolve_invocation`] is a pure function of its inputs. The only
//! non-deterministic ingredient, the machine name, arrives as an
//! [`InstanceId`] that callers may pin.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use uuid::Uuid;

use crate::environment::HostEnvironment;
use crate::host::HostContext;
use crate::options::{BindMount, EnvAssignment, SandboxConfig};
use crate::snapshot::Subvolume;

const CGROUP_ENV: &str = "UNIFIED_CGROUP_HIERARCHY=yes";
const OS_RELEASE_PATHS: [&str; 2] = ["/usr/lib/os-release", "/etc/os-release"];
const LOGS_MOUNT: &str = "/logs";
const FUSE_DEVICE: &str = "/dev/fuse";

/// Random identifier naming one container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// A fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// A fixed identifier, for reproducible invocations.
    #[must_use]
    pub fn pinned(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Per-launch facts that are not part of the configuration.
#[derive(Debug, Clone, Copy)]
pub struct InvocationInputs<'a> {
    /// Filesystem tree the container boots from (the snapshot, if any).
    pub root: &'a Subvolume,
    /// Whether layer metadata says its artifacts may need the repository.
    pub layer_requires_repo: bool,
    /// Machine name for this launch.
    pub instance: InstanceId,
    /// Isolation runtime executable.
    pub nspawn_binary: &'a OsStr,
}

/// Concrete argument vector and environments for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInvocation {
    runtime_args: Vec<OsString>,
    runtime_env: HostEnvironment,
    command_env: Vec<EnvAssignment>,
    command: Vec<OsString>,
    user: String,
    instance: InstanceId,
}

impl ResolvedInvocation {
    /// Runtime arguments up to, but excluding, the guest launch section.
    #[must_use]
    pub fn runtime_args(&self) -> &[OsString] {
        &self.runtime_args
    }

    /// Environment for the runtime process itself.
    #[must_use]
    pub fn runtime_env(&self) -> &HostEnvironment {
        &self.runtime_env
    }

    /// Environment for the guest command, one entry per key.
    #[must_use]
    pub fn command_env(&self) -> &[EnvAssignment] {
        &self.command_env
    }

    /// Machine name used for this launch.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Guest launch section: run as pid 2 under the target user.
    #[must_use]
    pub fn guest_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--as-pid2"),
            OsString::from(format!("--user={}", self.user)),
        ];
        args.extend(
            self.command_env
                .iter()
                .map(|assignment| OsString::from(format!("--setenv={assignment}"))),
        );
        args.push(OsString::from("--"));
        args.extend(self.command.iter().cloned());
        args
    }

    /// Complete argument vector, starting with the `env` program.
    #[must_use]
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = self.runtime_args.clone();
        argv.extend(self.guest_args());
        argv
    }
}

/// Whether the repository root must be bound into the guest.
#[must_use]
pub fn requires_repo(config: &SandboxConfig, layer_requires_repo: bool) -> bool {
    config.bind_repo_ro() || layer_requires_repo
}

/// Builds the invocation for `config` on `inputs.root`.
///
/// Flags are emitted in a fixed order: hardening, os-release placeholder,
/// journal/settings/timezone hygiene, then the configurable extras. The repo
/// bind is skipped when `host` knows no repository root; callers that need
/// it reject that case beforehand.
#[must_use]
pub fn resolve_invocation(
    config: &SandboxConfig,
    host: &HostContext,
    inputs: &InvocationInputs<'_>,
) -> ResolvedInvocation {
    let mut args: Vec<OsString> = vec![
        OsString::from("env"),
        OsString::from(CGROUP_ENV),
        inputs.nspawn_binary.to_os_string(),
        OsString::from("--register=no"),
        OsString::from("--keep-unit"),
        OsString::from("--machine"),
        OsString::from(inputs.instance.to_string()),
        OsString::from("--directory"),
        inputs.root.path().as_os_str().to_os_string(),
    ];

    let has_os_release = OS_RELEASE_PATHS
        .iter()
        .any(|path| inputs.root.path_in_image(path).exists());
    if !has_os_release {
        args.extend(bind_args(
            &BindMount::new("/dev/null", OS_RELEASE_PATHS[0]),
            true,
        ));
    }

    args.extend(
        ["--link-journal=no", "--settings=no", "--timezone=off"]
            .into_iter()
            .map(OsString::from),
    );
    args.extend(extra_args(config, host, inputs.layer_requires_repo));

    ResolvedInvocation {
        runtime_args: args,
        runtime_env: host.environment().sanitized(),
        command_env: command_env(config, host.environment()),
        command: config.command().to_vec(),
        user: config.user().name().to_owned(),
        instance: inputs.instance,
    }
}

fn extra_args(
    config: &SandboxConfig,
    host: &HostContext,
    layer_requires_repo: bool,
) -> Vec<OsString> {
    let debug = config.debug_options();
    let mut args = Vec::new();

    if config.quiet() {
        args.push(OsString::from("--quiet"));
    }
    if debug.private_network() {
        args.push(OsString::from("--private-network"));
    }
    for mount in config.bindmount_rw() {
        args.extend(bind_args(mount, false));
    }
    for mount in config.bindmount_ro() {
        args.extend(bind_args(mount, true));
    }
    // Only mounted inside the container, so a persisted snapshot never sees it.
    if requires_repo(config, layer_requires_repo)
        && let Some(root) = host.repo_root()
    {
        args.extend(bind_args(&BindMount::new(root, root), true));
    }
    if debug.logs_tmpfs() {
        let user = config.user();
        args.push(OsString::from(format!(
            "--tmpfs={LOGS_MOUNT}:uid={},gid={},mode=0755,nodev,nosuid,noexec",
            user.uid(),
            user.gid()
        )));
    }
    if host.fuse_device() {
        args.push(OsString::from(format!("--bind-ro={FUSE_DEVICE}")));
    }
    if debug.cap_net_admin() {
        args.push(OsString::from("--capability=CAP_NET_ADMIN"));
    }
    if let Some(hostname) = config.hostname() {
        args.push(OsString::from(format!("--hostname={hostname}")));
    }
    if !config.allow_mknod() {
        args.push(OsString::from("--drop-capability=CAP_MKNOD"));
    }
    args
}

fn bind_args(mount: &BindMount, read_only: bool) -> [OsString; 2] {
    let flag = if read_only { "--bind-ro" } else { "--bind" };
    let mut spec = colon_quote(mount.source().as_os_str());
    spec.push(":");
    spec.push(colon_quote(mount.destination().as_os_str()));
    [OsString::from(flag), spec]
}

/// Escapes `\` and `:` with a backslash, as bind specifications require.
#[must_use]
pub fn colon_quote(path: &OsStr) -> OsString {
    let mut quoted = Vec::with_capacity(path.len());
    for byte in path.as_bytes() {
        if matches!(byte, b'\\' | b':') {
            quoted.push(b'\\');
        }
        quoted.push(*byte);
    }
    OsString::from_vec(quoted)
}

/// Guest environment: forwarded host variables first, then explicit
/// assignments. A repeated key keeps its first position and takes the later
/// value.
fn command_env(config: &SandboxConfig, environment: &HostEnvironment) -> Vec<EnvAssignment> {
    let forwarded = if config.debug_options().forward_tls_env() {
        environment
            .forwarded()
            .into_iter()
            .filter_map(|(key, value)| EnvAssignment::new(key, value).ok())
            .collect()
    } else {
        Vec::new()
    };

    let mut merged: Vec<EnvAssignment> = Vec::new();
    for assignment in forwarded.into_iter().chain(config.setenv().iter().cloned()) {
        match merged
            .iter_mut()
            .find(|existing| existing.key() == assignment.key())
        {
            Some(existing) => *existing = assignment,
            None => merged.push(assignment),
        }
    }
    merged
}

/// Renders an argument vector for log output.
pub(crate) fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
