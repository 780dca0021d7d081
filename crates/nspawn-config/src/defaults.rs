use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Default log filter expression used by the binary.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default isolation runtime executable.
pub const DEFAULT_NSPAWN_BINARY: &str = "systemd-nspawn";

/// Default privilege wrapper.
pub const DEFAULT_SUDO_BINARY: &str = "sudo";

/// Default namespace entry tool.
pub const DEFAULT_NSENTER_BINARY: &str = "nsenter";

/// `PATH` handed to privileged helpers, which must not inherit the caller's.
pub const DEFAULT_PRIVILEGED_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Bound on each wait of the socket handoff, in milliseconds.
pub const DEFAULT_HANDOFF_TIMEOUT_MS: u64 = 3_000;

/// Interval between repo server readiness checks, in milliseconds.
pub const DEFAULT_READINESS_POLL_MS: u64 = 100;

/// Default repository server executable.
pub const DEFAULT_REPO_SERVER_BINARY: &str = "repo-server";

/// Default log filter expression used by the binary.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binary.
pub fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

pub(crate) fn default_nspawn_binary() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_NSPAWN_BINARY)
}

pub(crate) fn default_sudo_binary() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_SUDO_BINARY)
}

pub(crate) fn default_nsenter_binary() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_NSENTER_BINARY)
}

pub(crate) fn default_privileged_path() -> String {
    DEFAULT_PRIVILEGED_PATH.to_owned()
}

pub(crate) fn default_handoff_timeout_ms() -> u64 {
    DEFAULT_HANDOFF_TIMEOUT_MS
}

pub(crate) fn default_readiness_poll_ms() -> u64 {
    DEFAULT_READINESS_POLL_MS
}

pub(crate) fn default_repo_server_binary() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_REPO_SERVER_BINARY)
}
