//! Command-line runtime for `nspawn-run`.
//!
//! The module owns argument parsing, configuration bootstrapping, telemetry,
//! and dispatch to the subcommands. Configuration loading and the
//! shutdown signal can be substituted so the runtime is testable without a
//! real configuration stack or process signals.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use nspawn_config::Config;

mod cli;
mod config;
mod courier;
mod errors;
mod exec;
mod serve;
mod shutdown;
mod telemetry;

#[cfg(test)]
mod tests;

use cli::{Cli, CliCommand};
use config::{ConfigLoader, OrthoConfigLoader, split_config_arguments};
pub(crate) use errors::AppError;
use shutdown::{ShutdownSignal, SystemShutdownSignal};

/// Tracing target for the command-line runtime.
pub(crate) const CLI_TARGET: &str = "nspawn_run::cli";

struct CliRunner<'a, L: ConfigLoader> {
    loader: &'a L,
    shutdown: Option<&'a dyn ShutdownSignal>,
}

impl<'a, L: ConfigLoader> CliRunner<'a, L> {
    const fn new(loader: &'a L) -> Self {
        Self {
            loader,
            shutdown: None,
        }
    }

    #[cfg(test)]
    const fn with_shutdown(mut self, shutdown: &'a dyn ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn run<I, W, E>(&self, args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
    where
        I: IntoIterator<Item = OsString>,
        W: Write,
        E: Write,
    {
        let args: Vec<OsString> = args.into_iter().collect();
        let split = split_config_arguments(&args);

        let cli = match Cli::try_parse_from(&split.cli_arguments) {
            Ok(cli) => cli,
            Err(error) if is_informational(error.kind()) => {
                let _ = write!(stdout, "{}", error.render());
                return ExitCode::SUCCESS;
            }
            Err(error) => {
                let _ = write!(stderr, "{}", error.render());
                return ExitCode::FAILURE;
            }
        };

        match self.dispatch(cli, &split.config_arguments) {
            Ok(exit_code) => exit_code,
            Err(error) => report(stderr, &error),
        }
    }

    fn dispatch(&self, cli: Cli, config_arguments: &[OsString]) -> Result<ExitCode, AppError> {
        let verbose = cli.command.verbose();
        match &cli.command {
            CliCommand::Run(args) => {
                let config = self.prepare(config_arguments, verbose)?;
                exec::run_sandbox(args, &config)
            }
            CliCommand::ServeRepos(args) => {
                let config = self.prepare(config_arguments, verbose)?;
                match self.shutdown {
                    Some(shutdown) => serve::serve(args, &config, shutdown)?,
                    None => serve::serve(args, &config, &SystemShutdownSignal::install()?)?,
                }
                Ok(ExitCode::SUCCESS)
            }
            CliCommand::SendSockets(args) => {
                // Runs under nsenter with a reset environment; operator
                // configuration is not consulted.
                telemetry::initialise(&Config::default(), verbose)?;
                courier::send_sockets(args)?;
                Ok(ExitCode::SUCCESS)
            }
            CliCommand::ReceiveFds(args) => {
                // Runs under the privilege wrapper, which resets the
                // environment.
                telemetry::initialise(&Config::default(), verbose)?;
                match exec::receive_fds(args)? {}
            }
        }
    }

    fn prepare(&self, config_arguments: &[OsString], verbose: bool) -> Result<Config, AppError> {
        let config = self.loader.load(config_arguments)?;
        telemetry::initialise(&config, verbose)?;
        Ok(config)
    }
}

const fn is_informational(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::DisplayHelp | ErrorKind::DisplayVersion)
}

fn report<E: Write>(stderr: &mut E, error: &AppError) -> ExitCode {
    let _ = writeln!(stderr, "error: {error}");
    ExitCode::FAILURE
}

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    CliRunner::new(&OrthoConfigLoader).run(args, stdout, stderr)
}

#[cfg(test)]
pub(crate) fn run_with<I, W, E, L>(
    args: I,
    stdout: &mut W,
    stderr: &mut E,
    loader: &L,
    shutdown: &dyn ShutdownSignal,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    CliRunner::new(loader)
        .with_shutdown(shutdown)
        .run(args, stdout, stderr)
}
