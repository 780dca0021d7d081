//! Error type for the CLI runtime.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use netns_handoff::{HandoffError, SupervisorError};
use nspawn_config::ScratchPathsError;
use nspawn_sandbox::{ConfigurationError, SandboxError};
use thiserror::Error;

use crate::shutdown::ShutdownError;
use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Scratch(#[from] ScratchPathsError),
    #[error("invalid sandbox configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("failed to locate the nspawn-run executable: {0}")]
    CurrentExe(io::Error),
    #[error("descriptor {fd} is not open: {source}")]
    ListenFd { fd: RawFd, source: nix::errno::Errno },
}
