//! Signal handling for the long-running and interactive subcommands.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use signal_hook::SigId;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{debug, info};

use crate::CLI_TARGET;

/// Abstraction over shutdown notification mechanisms.
pub(crate) trait ShutdownSignal {
    /// Blocks until shutdown should proceed.
    fn wait(&self) -> Result<(), ShutdownError>;
}

/// Errors reported by signal handling.
#[derive(Debug, Error)]
pub(crate) enum ShutdownError {
    #[error("failed to install signal handlers: {source}")]
    Install {
        #[source]
        source: io::Error,
    },
}

/// Waits for a termination signal.
///
/// Handlers are registered on construction so a signal that arrives while
/// servers are still starting is not lost.
pub(crate) struct SystemShutdownSignal {
    signals: Mutex<Signals>,
}

impl SystemShutdownSignal {
    pub(crate) fn install() -> Result<Self, ShutdownError> {
        let signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| ShutdownError::Install { source })?;
        Ok(Self {
            signals: Mutex::new(signals),
        })
    }
}

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<(), ShutdownError> {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = signals.forever().next() {
            info!(target: CLI_TARGET, signal, "shutdown signal received");
        }
        Ok(())
    }
}

/// Keeps SIGINT and SIGTERM from terminating the process while a sandbox
/// runs. The guest shares our process group and sees a terminal interrupt
/// itself. SIGTERM aimed at us alone is recorded in [`Self::termination`]
/// so the caller can pass it on before the snapshot is deleted.
pub(crate) struct InterruptShield {
    interrupted: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    registrations: Vec<SigId>,
}

impl InterruptShield {
    pub(crate) fn raise() -> Result<Self, ShutdownError> {
        let mut shield = Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
            registrations: Vec::with_capacity(3),
        };
        let flags = [
            (SIGINT, Arc::clone(&shield.interrupted)),
            (SIGTERM, Arc::clone(&shield.interrupted)),
            (SIGTERM, Arc::clone(&shield.terminated)),
        ];
        for (signal, flag) in flags {
            let id = signal_hook::flag::register(signal, flag)
                .map_err(|source| ShutdownError::Install { source })?;
            shield.registrations.push(id);
        }
        Ok(shield)
    }

    /// Whether a shielded signal arrived.
    pub(crate) fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Set once SIGTERM arrives; the sandbox should then be stopped.
    pub(crate) fn termination(&self) -> &AtomicBool {
        &self.terminated
    }
}

impl Drop for InterruptShield {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        if self.termination().load(Ordering::Relaxed) {
            info!(target: CLI_TARGET, "termination requested while the sandbox ran");
        } else if self.interrupted() {
            debug!(target: CLI_TARGET, "interrupt delivered while the sandbox ran");
        }
    }
}
