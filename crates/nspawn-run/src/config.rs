//! Separates configuration flags from the subcommand and loads `Config`.
//!
//! Configuration flags must precede the subcommand. Everything from the first
//! token that is not a recognised configuration flag onwards belongs to clap.

use std::ffi::{OsStr, OsString};

use nspawn_config::Config;
use ortho_config::OrthoConfig;

use crate::AppError;

/// Flags understood by the configuration loader.
///
/// Keep in sync with the fields of [`nspawn_config::Config`].
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--log-filter",
    "--log-format",
    "--nspawn-binary",
    "--sudo-binary",
    "--nsenter-binary",
    "--privileged-path",
    "--handoff-timeout-ms",
    "--readiness-poll-ms",
    "--repo-server-binary",
    "--scratch-dir",
    "--snapshot-dir",
];

pub(crate) trait ConfigLoader {
    /// Loads configuration from the program name plus the configuration
    /// flags that preceded the subcommand.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        Config::load_from_iter(args.iter().cloned()).map_err(AppError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Stop,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    let Some(body) = text.strip_prefix("--") else {
        return FlagAction::Stop;
    };
    let (name, inline_value) = match body.split_once('=') {
        Some((name, _)) => (name, true),
        None => (body, false),
    };
    let known = CONFIG_CLI_FLAGS
        .iter()
        .any(|flag| flag.strip_prefix("--") == Some(name));
    if known {
        FlagAction::Include {
            needs_value: !inline_value,
        }
    } else {
        FlagAction::Stop
    }
}

/// Configuration arguments and the arguments left for clap.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) cli_arguments: Vec<OsString>,
}

pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let mut remaining = args.iter();
    let Some(program) = remaining.next() else {
        return ConfigArgumentSplit::default();
    };

    let mut split = ConfigArgumentSplit {
        config_arguments: vec![program.clone()],
        cli_arguments: vec![program.clone()],
    };
    while let Some(argument) = remaining.next() {
        match classify(argument) {
            FlagAction::Include { needs_value } => {
                split.config_arguments.push(argument.clone());
                if needs_value && let Some(value) = remaining.next() {
                    split.config_arguments.push(value.clone());
                }
            }
            FlagAction::Stop => {
                split.cli_arguments.push(argument.clone());
                split.cli_arguments.extend(remaining.by_ref().cloned());
                break;
            }
        }
    }
    split
}
