//! Derives the scratch directory holding handoff rendezvous sockets.
//!
//! Snapshots never live here: the runtime directory is usually tmpfs and a
//! btrfs snapshot must stay on the layer's filesystem.
//!
//! An explicit `scratch_dir` wins. Otherwise the per-user runtime directory is
//! used, falling back to a uid-namespaced directory under the system
//! temporary directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use libc::geteuid;

const SCRATCH_NAMESPACE: &str = "nspawn-run";

/// Canonical scratch locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchPaths {
    root: PathBuf,
    rendezvous: PathBuf,
}

impl ScratchPaths {
    /// Derives and creates the scratch directories for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchPathsError::ScratchDirectory`] when a directory
    /// cannot be created.
    pub fn from_config(config: &Config) -> Result<Self, ScratchPathsError> {
        let root = match config.scratch_dir() {
            Some(explicit) => explicit.as_std_path().to_path_buf(),
            None => default_scratch_directory(),
        };
        Self::create(root)
    }

    /// Uses `root` as the scratch directory, creating it and its children.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchPathsError::ScratchDirectory`] when a directory
    /// cannot be created.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, ScratchPathsError> {
        let root = root.into();
        let rendezvous = root.join("handoff");
        fs::create_dir_all(&rendezvous).map_err(|source| ScratchPathsError::ScratchDirectory {
            path: rendezvous.clone(),
            source,
        })?;
        Ok(Self { root, rendezvous })
    }

    /// Scratch root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding short-lived rendezvous sockets.
    #[must_use]
    pub fn rendezvous(&self) -> &Path {
        &self.rendezvous
    }
}

fn default_scratch_directory() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push(SCRATCH_NAMESPACE);
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push(SCRATCH_NAMESPACE);
        dir.push(format!("uid-{}", unsafe { geteuid() }));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push(SCRATCH_NAMESPACE);
        dir
    }
}

/// Errors raised while deriving scratch paths.
#[derive(Debug, Error)]
pub enum ScratchPathsError {
    /// Creating a scratch directory failed.
    #[error("failed to prepare scratch directory '{path}': {source}")]
    ScratchDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
