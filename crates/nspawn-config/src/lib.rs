//! Layered operator configuration for `nspawn-run`.
//!
//! Values come from a TOML file (`--config-path` or `NSPAWN_CONFIG_PATH`),
//! then `NSPAWN_*` environment variables, then command-line flags; later
//! layers win. Loading is delegated to `ortho_config`.

mod defaults;
mod logging;
mod scratch;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_HANDOFF_TIMEOUT_MS, DEFAULT_LOG_FILTER, DEFAULT_NSENTER_BINARY, DEFAULT_NSPAWN_BINARY,
    DEFAULT_PRIVILEGED_PATH, DEFAULT_READINESS_POLL_MS, DEFAULT_REPO_SERVER_BINARY,
    DEFAULT_SUDO_BINARY, default_log_filter, default_log_filter_string, default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use scratch::{ScratchPaths, ScratchPathsError};

/// Configuration shared by every `nspawn-run` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "NSPAWN")]
pub struct Config {
    /// `tracing` filter expression.
    #[serde(default = "defaults::default_log_filter_string")]
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,

    /// Log output format.
    #[serde(default = "defaults::default_log_format")]
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,

    /// Isolation runtime executable.
    #[serde(default = "defaults::default_nspawn_binary")]
    #[ortho_config(default = defaults::default_nspawn_binary())]
    pub nspawn_binary: Utf8PathBuf,

    /// Privilege wrapper used for the runtime, snapshots, and namespace entry.
    #[serde(default = "defaults::default_sudo_binary")]
    #[ortho_config(default = defaults::default_sudo_binary())]
    pub sudo_binary: Utf8PathBuf,

    /// Namespace entry tool.
    #[serde(default = "defaults::default_nsenter_binary")]
    #[ortho_config(default = defaults::default_nsenter_binary())]
    pub nsenter_binary: Utf8PathBuf,

    /// `PATH` for privileged helpers.
    #[serde(default = "defaults::default_privileged_path")]
    #[ortho_config(default = defaults::default_privileged_path())]
    pub privileged_path: String,

    /// Bound on each wait of the socket handoff, in milliseconds.
    #[serde(default = "defaults::default_handoff_timeout_ms")]
    #[ortho_config(default = defaults::default_handoff_timeout_ms())]
    pub handoff_timeout_ms: u64,

    /// Interval between repo server readiness checks, in milliseconds.
    #[serde(default = "defaults::default_readiness_poll_ms")]
    #[ortho_config(default = defaults::default_readiness_poll_ms())]
    pub readiness_poll_ms: u64,

    /// Repository server executable.
    #[serde(default = "defaults::default_repo_server_binary")]
    #[ortho_config(default = defaults::default_repo_server_binary())]
    pub repo_server_binary: Utf8PathBuf,

    /// Directory for rendezvous sockets. Derived when unset.
    #[serde(default)]
    pub scratch_dir: Option<Utf8PathBuf>,

    /// Directory for ephemeral snapshots. Must sit on the layer's btrfs
    /// filesystem; snapshots land beside the layer when unset.
    #[serde(default)]
    pub snapshot_dir: Option<Utf8PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: defaults::default_log_filter_string(),
            log_format: defaults::default_log_format(),
            nspawn_binary: defaults::default_nspawn_binary(),
            sudo_binary: defaults::default_sudo_binary(),
            nsenter_binary: defaults::default_nsenter_binary(),
            privileged_path: defaults::default_privileged_path(),
            handoff_timeout_ms: defaults::default_handoff_timeout_ms(),
            readiness_poll_ms: defaults::default_readiness_poll_ms(),
            repo_server_binary: defaults::default_repo_server_binary(),
            scratch_dir: None,
            snapshot_dir: None,
        }
    }
}

impl Config {
    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Isolation runtime executable.
    #[must_use]
    pub fn nspawn_binary(&self) -> &Utf8Path {
        &self.nspawn_binary
    }

    /// Privilege wrapper.
    #[must_use]
    pub fn sudo_binary(&self) -> &Utf8Path {
        &self.sudo_binary
    }

    /// Namespace entry tool.
    #[must_use]
    pub fn nsenter_binary(&self) -> &Utf8Path {
        &self.nsenter_binary
    }

    /// `PATH` for privileged helpers.
    #[must_use]
    pub fn privileged_path(&self) -> &str {
        &self.privileged_path
    }

    /// Bound on each wait of the socket handoff.
    #[must_use]
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    /// Interval between readiness checks.
    #[must_use]
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    /// Repository server executable.
    #[must_use]
    pub fn repo_server_binary(&self) -> &Utf8Path {
        &self.repo_server_binary
    }

    /// Explicit scratch directory, if configured.
    #[must_use]
    pub fn scratch_dir(&self) -> Option<&Utf8Path> {
        self.scratch_dir.as_deref()
    }

    /// Explicit snapshot directory, if configured.
    #[must_use]
    pub fn snapshot_dir(&self) -> Option<&Utf8Path> {
        self.snapshot_dir.as_deref()
    }
}
