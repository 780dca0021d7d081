//! Log output formats accepted by `--log-format` and `NSPAWN_LOG_FORMAT`.
//!
//! Compact lines suit an operator's terminal. JSON suits a supervisor that
//! ships standard error to a log stack, so it never carries colour codes.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How diagnostics are rendered on standard error.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    EnumString,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One flattened JSON object per event.
    Json,
    /// Single human-readable line per event.
    #[default]
    Compact,
}

impl LogFormat {
    /// Whether events are machine-readable records.
    #[must_use]
    pub const fn is_structured(self) -> bool {
        matches!(self, Self::Json)
    }

    /// Whether ANSI colour belongs in the output, given whether standard
    /// error is a terminal.
    #[must_use]
    pub const fn uses_ansi(self, stderr_is_terminal: bool) -> bool {
        !self.is_structured() && stderr_is_terminal
    }
}

/// Error returned when text names no [`LogFormat`].
pub type LogFormatParseError = strum::ParseError;
