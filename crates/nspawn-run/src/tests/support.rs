//! Harness types for driving the CLI runtime in-process.

use std::cell::Cell;
use std::ffi::OsString;
use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result, ensure};
use camino::Utf8PathBuf;
use netns_handoff::REPO_SERVER_PORTS_FILE;
use nspawn_config::Config;
use tempfile::TempDir;

use crate::config::ConfigLoader;
use crate::shutdown::{ShutdownError, ShutdownSignal};
use crate::{AppError, run_with};

pub(super) struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    pub(super) const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self, _args: &[OsString]) -> Result<Config, AppError> {
        Ok(self.config.clone())
    }
}

/// Shutdown signal that fires immediately and counts how often it was
/// awaited.
#[derive(Default)]
pub(super) struct ImmediateShutdown {
    waits: Cell<usize>,
}

impl ImmediateShutdown {
    pub(super) fn waits(&self) -> usize {
        self.waits.get()
    }
}

impl ShutdownSignal for ImmediateShutdown {
    fn wait(&self) -> Result<(), ShutdownError> {
        self.waits.set(self.waits.get() + 1);
        Ok(())
    }
}

pub(super) struct TestWorld {
    pub(super) _scratch: TempDir,
    pub(super) snapshot: TempDir,
    pub(super) config: Config,
    pub(super) shutdown: ImmediateShutdown,
    pub(super) stdout: Vec<u8>,
    pub(super) stderr: Vec<u8>,
    pub(super) exit_code: Option<ExitCode>,
}

impl TestWorld {
    pub(super) fn new() -> Result<Self> {
        let scratch = TempDir::new().context("scratch dir")?;
        let snapshot = TempDir::new().context("snapshot dir")?;
        let scratch_dir = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf())
            .map_err(|path| anyhow::anyhow!("non-UTF-8 scratch dir {}", path.display()))?;
        let config = Config {
            scratch_dir: Some(scratch_dir),
            ..Config::default()
        };
        Ok(Self {
            _scratch: scratch,
            snapshot,
            config,
            shutdown: ImmediateShutdown::default(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
        })
    }

    pub(super) fn write_ports(&self, contents: &str) -> Result<()> {
        fs::write(self.snapshot.path().join(REPO_SERVER_PORTS_FILE), contents)
            .context("write port list")
    }

    /// Runs `command`, replacing the `SNAPSHOT` token with the snapshot
    /// directory.
    pub(super) fn run(&mut self, command: &str) {
        self.stdout.clear();
        self.stderr.clear();
        let snapshot = self.snapshot.path().as_os_str().to_owned();
        let mut args = vec![OsString::from("nspawn-run")];
        args.extend(command.split_whitespace().map(|token| {
            match token.trim_matches('"') {
                "SNAPSHOT" => snapshot.clone(),
                other => OsString::from(other),
            }
        }));
        let loader = StaticConfigLoader::new(self.config.clone());
        let exit = run_with(
            args,
            &mut self.stdout,
            &mut self.stderr,
            &loader,
            &self.shutdown,
        );
        self.exit_code = Some(exit);
    }

    pub(super) fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub(super) fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub(super) fn assert_exit(&self, expected: ExitCode) -> Result<()> {
        let exit = self.exit_code.context("exit code recorded")?;
        ensure!(
            exit == expected,
            "expected {expected:?}, got {exit:?}; stderr: {}",
            self.stderr_text()
        );
        Ok(())
    }
}
