//! Shared fixtures for sandbox tests.
//!
//! The isolation runtime is replaced by a shell script run through the
//! privilege-wrapper slot, so the composed argument vector reaches the script
//! as `"$@"`. The script records its pid, arguments, and environment, notes
//! whether the container root exists while it runs, copies descriptor 3 when
//! descriptors were announced, and exits with `FAKE_EXIT`. With `FAKE_SLEEP`
//! set it becomes a long-running `sleep` instead.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::TempDir;

use crate::environment::HostEnvironment;
use crate::error::SnapshotError;
use crate::host::HostContext;
use crate::lifecycle::{RuntimeSettings, Sandbox};
use crate::snapshot::{LayerMetadata, SnapshotStore, Subvolume};

const FAKE_RUNTIME: &str = r#"#!/bin/sh
echo "$$" > "$FAKE_RECORD.pid"
printf '%s\n' "$@" > "$FAKE_RECORD.args"
env > "$FAKE_RECORD.env"
prev=""
for arg in "$@"; do
  if [ "$prev" = "--directory" ] && [ -d "$arg" ]; then
    echo present > "$FAKE_RECORD.root"
  fi
  prev="$arg"
done
if [ -n "${LISTEN_FDS:-}" ]; then
  cat <&3 > "$FAKE_RECORD.fd3"
fi
printf 'guest says hi\n'
if [ -n "${FAKE_SLEEP:-}" ]; then
  exec sleep "$FAKE_SLEEP"
fi
exit "${FAKE_EXIT:-0}"
"#;

/// Runs its arguments in the background and relays SIGTERM to them, the way
/// `sudo` sits between the orchestrator and the runtime.
const FORKING_WRAPPER: &str = r#"
trap 'kill -TERM "$child" 2>/dev/null; wait "$child"; exit 143' TERM
"$@" &
child=$!
wait "$child"
"#;

/// Ignores SIGTERM and never starts the runtime.
const STUBBORN_WRAPPER: &str = r#"
trap '' TERM
echo ready > "$FAKE_RECORD.ready"
while :; do sleep 1; done
"#;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot store that copies plain directories and records deletions.
///
/// When `pid_file` names a recorded runtime pid, each deletion also notes
/// whether that process was still alive.
#[derive(Debug, Clone, Default)]
pub struct CopyStore {
    pub deleted: Arc<Mutex<Vec<PathBuf>>>,
    pub mounts_cloned: Arc<Mutex<Vec<PathBuf>>>,
    pub pid_file: Option<PathBuf>,
    pub alive_at_delete: Arc<Mutex<Vec<bool>>>,
}

impl SnapshotStore for CopyStore {
    fn clone_subvolume(
        &self,
        source: &Subvolume,
        destination: &Path,
    ) -> Result<Subvolume, SnapshotError> {
        if destination.exists() {
            return Err(SnapshotError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }
        copy_tree(source.path(), destination)
            .map_err(|error| SnapshotError::Store(error.to_string()))?;
        Ok(Subvolume::new(destination))
    }

    fn clone_mounts(
        &self,
        _source: &Subvolume,
        destination: &Subvolume,
    ) -> Result<(), SnapshotError> {
        self.mounts_cloned
            .lock()
            .expect("mounts lock")
            .push(destination.path().to_path_buf());
        Ok(())
    }

    fn delete(&self, subvolume: &Subvolume) -> Result<(), SnapshotError> {
        if let Some(pid) = self.pid_file.as_deref().and_then(read_pid) {
            self.alive_at_delete
                .lock()
                .expect("alive lock")
                .push(process_alive(pid));
        }
        fs::remove_dir_all(subvolume.path())
            .map_err(|error| SnapshotError::Store(error.to_string()))?;
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(subvolume.path().to_path_buf());
        Ok(())
    }
}

fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Metadata reader returning a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedMetadata(pub bool);

impl LayerMetadata for FixedMetadata {
    fn artifacts_may_require_repo(&self, _layer: &Subvolume) -> Result<bool, SnapshotError> {
        Ok(self.0)
    }
}

/// Temporary layer, fake runtime, and wrapper scripts.
///
/// `scratch` is the layer's parent directory, where ephemeral snapshots land
/// by default.
pub struct Harness {
    pub dir: TempDir,
    pub layer: Subvolume,
    pub scratch: PathBuf,
    pub record: PathBuf,
    pub script: PathBuf,
    pub forking_wrapper: PathBuf,
    pub stubborn_wrapper: PathBuf,
    pub store: CopyStore,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to allocate temporary directory");
        let scratch = dir.path().join("layers/hello");
        let layer_root = scratch.join("volume");
        fs::create_dir_all(layer_root.join("etc")).expect("layer");
        fs::write(layer_root.join("etc/os-release"), "ID=test\n").expect("os-release");
        let script = dir.path().join("fake-runtime.sh");
        fs::write(&script, FAKE_RUNTIME).expect("fake runtime");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod runtime");
        let forking_wrapper = dir.path().join("forking-wrapper.sh");
        fs::write(&forking_wrapper, FORKING_WRAPPER).expect("forking wrapper");
        let stubborn_wrapper = dir.path().join("stubborn-wrapper.sh");
        fs::write(&stubborn_wrapper, STUBBORN_WRAPPER).expect("stubborn wrapper");
        let record = dir.path().join("record");
        Self {
            scratch,
            store: CopyStore {
                pid_file: Some(record.with_extension("pid")),
                ..CopyStore::default()
            },
            record,
            layer: Subvolume::new(layer_root),
            script,
            forking_wrapper,
            stubborn_wrapper,
            dir,
        }
    }

    pub fn environment(&self, exit_code: i32, extra: &[(&str, &str)]) -> HostEnvironment {
        let mut vars = vec![
            (String::from("PATH"), String::from("/usr/bin:/bin")),
            (String::from("FAKE_RECORD"), self.record.display().to_string()),
            (String::from("FAKE_EXIT"), exit_code.to_string()),
        ];
        vars.extend(
            extra
                .iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned())),
        );
        vars.into_iter().collect()
    }

    /// The fake runtime runs in the wrapper slot.
    pub fn settings(&self) -> RuntimeSettings {
        RuntimeSettings::new()
            .with_nspawn_binary("fake-nspawn")
            .with_privilege_wrapper([
                PathBuf::from("/bin/sh").into_os_string(),
                self.script.clone().into_os_string(),
            ])
            .with_termination_grace(Duration::from_secs(5))
    }

    /// No wrapper; the fake runtime is the runtime executable itself.
    pub fn direct_settings(&self) -> RuntimeSettings {
        RuntimeSettings::new()
            .with_nspawn_binary(self.script.clone().into_os_string())
            .with_privilege_wrapper(Vec::<PathBuf>::new())
    }

    /// The fake runtime runs behind a wrapper that forks and relays SIGTERM.
    pub fn forking_settings(&self) -> RuntimeSettings {
        self.settings().with_privilege_wrapper([
            PathBuf::from("/bin/sh"),
            self.forking_wrapper.clone(),
            PathBuf::from("/bin/sh"),
            self.script.clone(),
        ])
    }

    /// A wrapper that ignores SIGTERM.
    pub fn stubborn_settings(&self, grace: Duration) -> RuntimeSettings {
        self.settings()
            .with_privilege_wrapper([PathBuf::from("/bin/sh"), self.stubborn_wrapper.clone()])
            .with_termination_grace(grace)
    }

    pub fn sandbox(&self, exit_code: i32, extra: &[(&str, &str)]) -> Sandbox<CopyStore> {
        self.sandbox_with(self.settings(), exit_code, extra)
    }

    pub fn sandbox_with(
        &self,
        settings: RuntimeSettings,
        exit_code: i32,
        extra: &[(&str, &str)],
    ) -> Sandbox<CopyStore> {
        Sandbox::new(
            self.store.clone(),
            settings,
            HostContext::new(self.environment(exit_code, extra)),
        )
        .with_metadata(FixedMetadata(false))
    }

    pub fn recorded_args(&self) -> Vec<String> {
        read_lines(&self.record.with_extension("args"))
    }

    pub fn recorded_env(&self) -> Vec<String> {
        read_lines(&self.record.with_extension("env"))
    }

    pub fn recorded_fd3(&self) -> String {
        fs::read_to_string(self.record.with_extension("fd3")).expect("descriptor 3 copy")
    }

    pub fn root_was_present(&self) -> bool {
        self.record.with_extension("root").exists()
    }

    /// Pid the fake runtime recorded, once it has started.
    pub fn runtime_pid(&self) -> i32 {
        let path = self.record.with_extension("pid");
        wait_for(|| read_pid(&path)).expect("runtime never recorded its pid")
    }

    /// Blocks until the record file with `extension` exists.
    pub fn wait_for_record(&self, extension: &str) {
        let path = self.record.with_extension(extension);
        wait_for(|| path.exists().then_some(()))
            .unwrap_or_else(|| panic!("{} never appeared", path.display()));
    }

    /// Snapshots currently beside the layer.
    pub fn scratch_entries(&self) -> Vec<PathBuf> {
        match fs::read_dir(&self.scratch) {
            Ok(entries) => entries
                .map(|entry| entry.expect("scratch entry").path())
                .filter(|path| path.as_path() != self.layer.path())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Polls `check` until it yields a value or the settle timeout passes.
pub fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let start = Instant::now();
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if start.elapsed() > SETTLE_TIMEOUT {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_else(|error| panic!("failed to read {}: {error}", path.display()))
        .lines()
        .map(str::to_owned)
        .collect()
}
