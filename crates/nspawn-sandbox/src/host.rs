//! Host facts the invocation builder depends on.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::environment::HostEnvironment;

const HOST_TARGET: &str = "nspawn_sandbox::host";
const FUSE_DEVICE: &str = "/dev/fuse";
const REPO_MARKERS: [&str; 3] = [".buckconfig", ".hg", ".git"];

/// Everything about the host that influences an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostContext {
    environment: HostEnvironment,
    repo_root: Option<PathBuf>,
    fuse_device: bool,
}

impl HostContext {
    /// Host context with no repository and no FUSE device.
    #[must_use]
    pub fn new(environment: HostEnvironment) -> Self {
        Self {
            environment,
            repo_root: None,
            fuse_device: false,
        }
    }

    /// Records the symlink-free repository root.
    #[must_use]
    pub fn with_repo_root(mut self, repo_root: impl Into<PathBuf>) -> Self {
        self.repo_root = Some(repo_root.into());
        self
    }

    /// Records whether `/dev/fuse` exists on the host.
    #[must_use]
    pub fn with_fuse_device(mut self, present: bool) -> Self {
        self.fuse_device = present;
        self
    }

    /// Reads the live host: process environment, repository root above the
    /// working directory, and the FUSE device.
    #[must_use]
    pub fn detect() -> Self {
        let repo_root = env::current_dir()
            .ok()
            .and_then(|cwd| find_repo_root(&cwd))
            .and_then(|root| match fs::canonicalize(&root) {
                Ok(resolved) => Some(resolved),
                Err(error) => {
                    debug!(
                        target: HOST_TARGET,
                        root = %root.display(),
                        %error,
                        "repository root could not be resolved"
                    );
                    None
                }
            });
        let fuse_device = Path::new(FUSE_DEVICE).exists();
        debug!(
            target: HOST_TARGET,
            repo_root = ?repo_root,
            fuse_device,
            "detected host"
        );
        Self {
            environment: HostEnvironment::capture(),
            repo_root,
            fuse_device,
        }
    }

    /// Captured host environment.
    #[must_use]
    pub fn environment(&self) -> &HostEnvironment {
        &self.environment
    }

    /// Repository root, if one was found.
    #[must_use]
    pub fn repo_root(&self) -> Option<&Path> {
        self.repo_root.as_deref()
    }

    /// Whether `/dev/fuse` should be bound into the guest.
    #[must_use]
    pub fn fuse_device(&self) -> bool {
        self.fuse_device
    }
}

/// Walks up from `start` to the first directory holding a repository marker.
#[must_use]
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| REPO_MARKERS.iter().any(|marker| marker_exists(&dir.join(marker))))
        .map(Path::to_path_buf)
}

fn marker_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
