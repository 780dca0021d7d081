//! Snapshot acquisition, runtime launch, and guaranteed teardown.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{ConfigurationError, SandboxError, SnapshotError};
use crate::forward::{DescriptorForwarder, SequentialForwarder, listen_fds_trampoline};
use crate::host::HostContext;
use crate::inject::{DescriptorReceiver, PendingInjection};
use crate::invocation::{
    InstanceId, InvocationInputs, ResolvedInvocation, display_argv, requires_repo,
    resolve_invocation,
};
use crate::options::{SandboxConfig, SnapshotMode};
use crate::snapshot::{LayerMetadata, MetaDirectory, SnapshotStore, Subvolume};

const LIFECYCLE_TARGET: &str = "nspawn_sandbox::lifecycle";
const DEFAULT_NSPAWN: &str = "systemd-nspawn";
const DEFAULT_WRAPPER: &str = "sudo";
const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const KILL_BINARY: &str = "kill";

/// Host-side settings for launching the isolation runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    nspawn_binary: OsString,
    privilege_wrapper: Vec<OsString>,
    snapshot_dir: Option<PathBuf>,
    descriptor_receiver: Option<DescriptorReceiver>,
    termination_grace: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeSettings {
    /// Settings that run `systemd-nspawn` through `sudo` and place each
    /// ephemeral snapshot beside its layer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nspawn_binary: OsString::from(DEFAULT_NSPAWN),
            privilege_wrapper: vec![OsString::from(DEFAULT_WRAPPER)],
            snapshot_dir: None,
            descriptor_receiver: None,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    /// Overrides the runtime executable.
    #[must_use]
    pub fn with_nspawn_binary(mut self, binary: impl Into<OsString>) -> Self {
        self.nspawn_binary = binary.into();
        self
    }

    /// Overrides the privilege wrapper. An empty wrapper runs the runtime
    /// directly.
    #[must_use]
    pub fn with_privilege_wrapper<I, S>(mut self, wrapper: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.privilege_wrapper = wrapper.into_iter().map(Into::into).collect();
        self
    }

    /// Keeps ephemeral snapshots in `dir` instead of beside the layer.
    ///
    /// Copy-on-write clones only work within one btrfs filesystem, so `dir`
    /// must live on the same volume as the layers.
    #[must_use]
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    /// Injects forwarded descriptors through `receiver` when a privilege
    /// wrapper is in use.
    #[must_use]
    pub fn with_descriptor_receiver(mut self, receiver: DescriptorReceiver) -> Self {
        self.descriptor_receiver = Some(receiver);
        self
    }

    /// How long a runtime asked to terminate may take before it is killed.
    #[must_use]
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Runtime executable.
    #[must_use]
    pub fn nspawn_binary(&self) -> &OsStr {
        &self.nspawn_binary
    }

    /// Privilege wrapper prefix.
    #[must_use]
    pub fn privilege_wrapper(&self) -> &[OsString] {
        &self.privilege_wrapper
    }

    /// Explicit directory for ephemeral snapshots, if any.
    #[must_use]
    pub fn snapshot_dir(&self) -> Option<&Path> {
        self.snapshot_dir.as_deref()
    }

    /// Receiver for descriptors forwarded through the wrapper.
    #[must_use]
    pub fn descriptor_receiver(&self) -> Option<&DescriptorReceiver> {
        self.descriptor_receiver.as_ref()
    }

    /// Grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub fn termination_grace(&self) -> Duration {
        self.termination_grace
    }
}

/// Where one standard stream of the runtime goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    /// Share the orchestrator's stream.
    Inherit,
    /// Discard.
    Null,
    /// Capture into [`RunOutcome`].
    Piped,
    /// Send to the orchestrator's standard error.
    Stderr,
}

impl Redirect {
    fn to_stdio(self) -> io::Result<Stdio> {
        Ok(match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
            Self::Piped => Stdio::piped(),
            Self::Stderr => Stdio::from(io::stderr().as_fd().try_clone_to_owned()?),
        })
    }
}

/// Stream redirection and failure policy for one run.
///
/// Standard output defaults to the orchestrator's standard error so that a
/// guest cannot write into output the orchestrator itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopenArgs {
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
    check: bool,
}

impl Default for PopenArgs {
    fn default() -> Self {
        Self {
            stdin: Redirect::Inherit,
            stdout: Redirect::Stderr,
            stderr: Redirect::Inherit,
            check: true,
        }
    }
}

impl PopenArgs {
    /// Redirects standard input.
    #[must_use]
    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
        self
    }

    /// Redirects standard output.
    #[must_use]
    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    /// Redirects standard error.
    #[must_use]
    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// Reports a non-zero exit as an outcome instead of an error.
    #[must_use]
    pub fn unchecked(mut self) -> Self {
        self.check = false;
        self
    }

    /// Whether a non-zero exit is an error.
    #[must_use]
    pub fn check(&self) -> bool {
        self.check
    }
}

/// Exit status and captured streams of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit status of the runtime, which mirrors the guest command.
    pub status: ExitStatus,
    /// Captured standard output, when piped.
    pub stdout: Option<Vec<u8>>,
    /// Captured standard error, when piped.
    pub stderr: Option<Vec<u8>>,
}

/// Phases of one isolated execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing acquired yet.
    Unstarted,
    /// The container filesystem is ready.
    SnapshotAcquired,
    /// The runtime process is alive.
    Running,
    /// The runtime exited successfully.
    Completed,
    /// The runtime exited unsuccessfully or could not be waited for.
    Failed,
    /// Snapshot released and process reaped.
    Released,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unstarted => "unstarted",
            Self::SnapshotAcquired => "snapshot-acquired",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Released => "released",
        };
        f.write_str(label)
    }
}

/// Ownership of the container filesystem for one execution.
#[derive(Debug)]
pub enum SnapshotLease<'a, S: SnapshotStore> {
    /// Exclusive scratch clone, deleted on drop.
    Ephemeral {
        /// The clone.
        subvolume: Subvolume,
        /// Store that deletes it.
        store: &'a S,
    },
    /// Clone at a caller-chosen path, kept on drop.
    Persisted(Subvolume),
    /// The layer itself, used in place.
    Direct(Subvolume),
}

impl<S: SnapshotStore> SnapshotLease<'_, S> {
    /// Filesystem tree the container runs on.
    #[must_use]
    pub fn subvolume(&self) -> &Subvolume {
        match self {
            Self::Ephemeral { subvolume, .. }
            | Self::Persisted(subvolume)
            | Self::Direct(subvolume) => subvolume,
        }
    }
}

impl<S: SnapshotStore> Drop for SnapshotLease<'_, S> {
    fn drop(&mut self) {
        let Self::Ephemeral { subvolume, store } = self else {
            return;
        };
        match store.delete(subvolume) {
            Ok(()) => debug!(
                target: LIFECYCLE_TARGET,
                snapshot = %subvolume.path().display(),
                "deleted ephemeral snapshot"
            ),
            Err(error) => warn!(
                target: LIFECYCLE_TARGET,
                snapshot = %subvolume.path().display(),
                %error,
                "failed to delete ephemeral snapshot"
            ),
        }
    }
}

/// Launches configured commands inside isolated containers.
pub struct Sandbox<S: SnapshotStore> {
    store: S,
    settings: RuntimeSettings,
    host: HostContext,
    metadata: Box<dyn LayerMetadata>,
    forwarder: Box<dyn DescriptorForwarder>,
}

impl<S: SnapshotStore> fmt::Debug for Sandbox<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("settings", &self.settings)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl<S: SnapshotStore> Sandbox<S> {
    /// Creates a sandbox over `store` with explicit host facts.
    #[must_use]
    pub fn new(store: S, settings: RuntimeSettings, host: HostContext) -> Self {
        Self {
            store,
            settings,
            host,
            metadata: Box::new(MetaDirectory),
            forwarder: Box::new(SequentialForwarder),
        }
    }

    /// Replaces the layer metadata reader.
    #[must_use]
    pub fn with_metadata(mut self, metadata: impl LayerMetadata + 'static) -> Self {
        self.metadata = Box::new(metadata);
        self
    }

    /// Replaces the descriptor forwarder.
    #[must_use]
    pub fn with_forwarder(mut self, forwarder: impl DescriptorForwarder + 'static) -> Self {
        self.forwarder = Box::new(forwarder);
        self
    }

    /// Host facts used for every launch.
    #[must_use]
    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// Runs `config` to completion.
    ///
    /// # Errors
    ///
    /// Returns the [`SandboxError`] of the first failing stage. With
    /// `check` enabled a non-zero exit yields [`SandboxError::CommandFailed`].
    pub fn run(
        &self,
        config: &SandboxConfig,
        popen: PopenArgs,
    ) -> Result<RunOutcome, SandboxError> {
        self.launch(config, popen)?.wait()
    }

    /// Acquires the snapshot and starts the runtime.
    ///
    /// The returned handle releases everything it owns when dropped, even if
    /// [`IsolatedProcess::wait`] is never called.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Configuration`] when the layer needs the
    /// repository but none is known, or when descriptors must cross a
    /// privilege wrapper without a [`DescriptorReceiver`].
    /// [`SandboxError::Snapshot`] reports a snapshot that cannot be acquired,
    /// [`SandboxError::Launch`] a runtime that cannot be spawned, and
    /// [`SandboxError::Injection`] forwarded descriptors that never reached
    /// the receiver.
    pub fn launch(
        &self,
        config: &SandboxConfig,
        popen: PopenArgs,
    ) -> Result<IsolatedProcess<'_, S>, SandboxError> {
        let instance = InstanceId::random();
        let mut state = LifecycleState::Unstarted;
        debug!(target: LIFECYCLE_TARGET, %instance, %state, "preparing sandbox");

        let layer_requires_repo = self.metadata.artifacts_may_require_repo(config.layer())?;
        if requires_repo(config, layer_requires_repo) && self.host.repo_root().is_none() {
            return Err(ConfigurationError::MissingRepoRoot.into());
        }

        let forwarded = config.forward_fd();
        let injection = self.prepare_injection(forwarded.len())?;
        let lease = self.acquire_snapshot(config, instance)?;
        state = transition(instance, state, LifecycleState::SnapshotAcquired);

        let invocation = resolve_invocation(
            config,
            &self.host,
            &InvocationInputs {
                root: lease.subvolume(),
                layer_requires_repo,
                instance,
                nspawn_binary: self.settings.nspawn_binary(),
            },
        );
        let (mut command, program) = self.compose_command(
            &invocation,
            forwarded.len(),
            injection.as_ref().map(PendingInjection::path),
        )?;
        command
            .stdin(redirect(popen.stdin, &program)?)
            .stdout(redirect(popen.stdout, &program)?)
            .stderr(redirect(popen.stderr, &program)?);

        let spawned = if forwarded.is_empty() || injection.is_some() {
            command.spawn()
        } else {
            self.forwarder.spawn_forwarding(command, forwarded)
        };
        let child = spawned.map_err(|source| SandboxError::Launch {
            program: program.clone(),
            source,
        })?;
        info!(
            target: LIFECYCLE_TARGET,
            %instance,
            pid = child.id(),
            snapshot = %lease.subvolume().path().display(),
            "launched sandbox"
        );
        state = transition(instance, state, LifecycleState::Running);

        let process = IsolatedProcess {
            child: Some(child),
            lease,
            invocation,
            popen,
            grace: self.settings.termination_grace(),
            wrapped: !self.settings.privilege_wrapper().is_empty(),
            state,
        };
        if let Some(injection) = injection {
            // A failed handoff drops `process`, which stops the runtime.
            injection.deliver(forwarded)?;
        }
        Ok(process)
    }

    /// Opens a rendezvous when forwarded descriptors must cross a wrapper.
    fn prepare_injection(
        &self,
        forwarded: usize,
    ) -> Result<Option<PendingInjection>, SandboxError> {
        if forwarded == 0 || self.settings.privilege_wrapper().is_empty() {
            return Ok(None);
        }
        let receiver = self
            .settings
            .descriptor_receiver()
            .ok_or(ConfigurationError::ForwardingNeedsReceiver)?;
        Ok(Some(receiver.open()?))
    }

    fn acquire_snapshot(
        &self,
        config: &SandboxConfig,
        instance: InstanceId,
    ) -> Result<SnapshotLease<'_, S>, SnapshotError> {
        let layer = config.layer();
        if config.snapshot() == SnapshotMode::Disabled {
            return Ok(SnapshotLease::Direct(layer.clone()));
        }
        if let Some(destination) = config.debug_options().snapshot_into() {
            let subvolume = self.store.clone_subvolume(layer, destination)?;
            let lease = SnapshotLease::Persisted(subvolume);
            self.store.clone_mounts(layer, lease.subvolume())?;
            return Ok(lease);
        }

        let destination = self.ephemeral_destination(layer, instance)?;
        let subvolume = self.store.clone_subvolume(layer, &destination)?;
        let lease = SnapshotLease::Ephemeral {
            subvolume,
            store: &self.store,
        };
        self.store.clone_mounts(layer, lease.subvolume())?;
        Ok(lease)
    }

    /// Scratch clones go beside the layer unless a snapshot directory is
    /// configured. A hidden sibling shares the layer's btrfs volume.
    fn ephemeral_destination(
        &self,
        layer: &Subvolume,
        instance: InstanceId,
    ) -> Result<PathBuf, SnapshotError> {
        let name = format!("{}-{instance}", layer.scratch_name());
        if let Some(dir) = self.settings.snapshot_dir() {
            fs::create_dir_all(dir).map_err(|source| SnapshotError::Scratch {
                path: dir.to_path_buf(),
                source,
            })?;
            return Ok(dir.join(name));
        }
        let parent = match layer.path().parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => {
                return Err(SnapshotError::NoSnapshotLocation {
                    layer: layer.path().to_path_buf(),
                });
            }
        };
        Ok(parent.join(format!(".{name}")))
    }

    fn compose_command(
        &self,
        invocation: &ResolvedInvocation,
        forwarded: usize,
        rendezvous: Option<&Path>,
    ) -> Result<(Command, String), SandboxError> {
        let mut argv: Vec<OsString> = self.settings.privilege_wrapper().to_vec();
        match (rendezvous, self.settings.descriptor_receiver()) {
            (Some(path), Some(receiver)) => {
                argv.extend(receiver.argv(path, forwarded, &invocation.argv()));
            }
            _ => {
                if forwarded > 0 {
                    argv.extend(listen_fds_trampoline(forwarded));
                }
                argv.extend(invocation.argv());
            }
        }
        debug!(target: LIFECYCLE_TARGET, argv = %display_argv(&argv), "composed runtime command");

        let Some((head, tail)) = argv.split_first() else {
            return Err(SandboxError::Launch {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty runtime command"),
            });
        };
        let program = head.to_string_lossy().into_owned();
        let mut command = Command::new(head);
        command
            .args(tail)
            .env_clear()
            .envs(invocation.runtime_env().iter());
        Ok((command, program))
    }
}

fn redirect(target: Redirect, program: &str) -> Result<Stdio, SandboxError> {
    target.to_stdio().map_err(|source| SandboxError::Launch {
        program: program.to_owned(),
        source,
    })
}

fn transition(instance: InstanceId, from: LifecycleState, to: LifecycleState) -> LifecycleState {
    debug!(target: LIFECYCLE_TARGET, %instance, %from, %to, "sandbox state change");
    to
}

/// A running container and everything it holds.
///
/// Dropping the handle stops a still-running runtime before the snapshot is
/// released: SIGTERM first, which privilege wrappers relay to the runtime,
/// then SIGKILL once the termination grace period has passed.
#[derive(Debug)]
pub struct IsolatedProcess<'a, S: SnapshotStore> {
    child: Option<Child>,
    lease: SnapshotLease<'a, S>,
    invocation: ResolvedInvocation,
    popen: PopenArgs,
    grace: Duration,
    wrapped: bool,
    state: LifecycleState,
}

impl<S: SnapshotStore> IsolatedProcess<'_, S> {
    /// Pid of the runtime process, while it is running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Filesystem tree the container runs on.
    #[must_use]
    pub fn subvolume(&self) -> &Subvolume {
        self.lease.subvolume()
    }

    /// Invocation used to start the runtime.
    #[must_use]
    pub fn invocation(&self) -> &ResolvedInvocation {
        &self.invocation
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Waits for the runtime to exit, then releases the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Wait`] when the process cannot be waited for,
    /// or [`SandboxError::CommandFailed`] for a checked non-zero exit.
    pub fn wait(self) -> Result<RunOutcome, SandboxError> {
        self.wait_or_terminate(&AtomicBool::new(false))
    }

    /// Like [`Self::wait`], but asks the runtime to terminate once `stop` is
    /// set, escalating to SIGKILL after the grace period.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::wait`]. A runtime stopped this way usually exits
    /// unsuccessfully, which a checked run reports as
    /// [`SandboxError::CommandFailed`].
    pub fn wait_or_terminate(mut self, stop: &AtomicBool) -> Result<RunOutcome, SandboxError> {
        let Some(mut child) = self.child.take() else {
            return Err(SandboxError::Wait {
                pid: 0,
                source: io::Error::new(io::ErrorKind::NotFound, "sandbox process already reaped"),
            });
        };
        let pid = child.id();
        let instance = self.invocation.instance();
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let status = match supervise(&mut child, stop, self.grace, self.wrapped) {
            Ok(status) => status,
            Err(source) => {
                self.state = transition(instance, self.state, LifecycleState::Failed);
                self.child = Some(child);
                return Err(SandboxError::Wait { pid, source });
            }
        };
        let collected = collect(stdout).and_then(|stdout| Ok((stdout, collect(stderr)?)));
        let (stdout, stderr) = match collected {
            Ok(streams) => streams,
            Err(source) => {
                self.state = transition(instance, self.state, LifecycleState::Failed);
                return Err(SandboxError::Wait { pid, source });
            }
        };
        let outcome = RunOutcome {
            status,
            stdout,
            stderr,
        };
        let next = if outcome.status.success() {
            LifecycleState::Completed
        } else {
            LifecycleState::Failed
        };
        self.state = transition(instance, self.state, next);
        info!(target: LIFECYCLE_TARGET, pid, status = %outcome.status, "sandbox exited");

        if self.popen.check() && !outcome.status.success() {
            return Err(SandboxError::CommandFailed {
                status: outcome.status,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            });
        }
        Ok(outcome)
    }
}

impl<S: SnapshotStore> Drop for IsolatedProcess<'_, S> {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            let stop = AtomicBool::new(true);
            if let Err(error) = supervise(&mut child, &stop, self.grace, self.wrapped) {
                warn!(target: LIFECYCLE_TARGET, pid, %error, "failed to stop sandbox process");
                if let Err(error) = child.kill() {
                    warn!(target: LIFECYCLE_TARGET, pid, %error, "failed to kill sandbox process");
                }
                if let Err(error) = child.wait() {
                    warn!(target: LIFECYCLE_TARGET, pid, %error, "failed to reap sandbox process");
                }
            }
        }
        self.state = transition(self.invocation.instance(), self.state, LifecycleState::Released);
    }
}

/// Waits for `child`, sending SIGTERM once `stop` is set and SIGKILL when
/// the grace period after that runs out.
fn supervise(
    child: &mut Child,
    stop: &AtomicBool,
    grace: Duration,
    wrapped: bool,
) -> io::Result<ExitStatus> {
    let pid = child.id();
    let mut deadline: Option<Instant> = None;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        match deadline {
            None if stop.load(Ordering::Relaxed) => {
                info!(target: LIFECYCLE_TARGET, pid, "asking sandbox process to terminate");
                request_termination(pid, wrapped)?;
                deadline = Some(Instant::now() + grace);
            }
            Some(limit) if Instant::now() >= limit => {
                warn!(
                    target: LIFECYCLE_TARGET,
                    pid,
                    grace_ms = grace.as_millis(),
                    "sandbox process outlived its grace period; killing"
                );
                child.kill()?;
                return child.wait();
            }
            _ => {}
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// `sudo` ignores signals sent from its parent's process group, so a wrapped
/// runtime is signalled by a `kill` running in a group of its own.
fn request_termination(pid: u32, wrapped: bool) -> io::Result<()> {
    if wrapped {
        let relayed = Command::new(KILL_BINARY)
            .args(["-s", "TERM"])
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .status();
        match relayed {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => {
                debug!(target: LIFECYCLE_TARGET, pid, %status, "kill helper failed");
            }
            Err(error) => {
                debug!(target: LIFECYCLE_TARGET, pid, %error, "kill helper unavailable");
            }
        }
    }
    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
}

fn drain<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer)?;
        Ok(buffer)
    })
}

fn collect(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> io::Result<Option<Vec<u8>>> {
    reader
        .map(|handle| {
            handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")))
        })
        .transpose()
}
