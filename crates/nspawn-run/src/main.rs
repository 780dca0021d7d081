//! Entry point for `nspawn-run`.
//!
//! All work happens in [`nspawn_run::run`], which parses arguments, loads
//! layered configuration, installs telemetry, and dispatches the subcommand.

use std::io::{self, StderrLock, StdoutLock};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout: StdoutLock<'_> = io::stdout().lock();
    let mut stderr: StderrLock<'_> = io::stderr().lock();
    nspawn_run::run(std::env::args_os(), &mut stdout, &mut stderr)
}
