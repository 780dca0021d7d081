//! Explicit snapshot of the host environment used to launch containers.
//!
//! Nothing in the sandbox reads `std::env` behind the caller's back: the
//! environment is captured once into a [`HostEnvironment`] and passed down,
//! which keeps invocation building deterministic under test.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};

/// Prefix the isolation runtime reserves for its own configuration.
pub const RUNTIME_RESERVED_PREFIX: &str = "SYSTEMD_NSPAWN_";

/// Prefix of host variables copied into the guest when forwarding is enabled.
pub const FORWARDED_ENV_PREFIX: &str = "THRIFT_TLS_";

/// Ordered host environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl HostEnvironment {
    /// Captures the current process environment.
    #[must_use]
    pub fn capture() -> Self {
        env::vars_os().collect()
    }

    /// Looks up a variable.
    #[must_use]
    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    /// Iterates over all variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars
            .iter()
            .map(|(key, value)| (key.as_os_str(), value.as_os_str()))
    }

    /// Environment for the runtime process: everything except variables the
    /// runtime would interpret as its own settings.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        self.vars
            .iter()
            .filter(|(key, _)| !has_prefix(key, RUNTIME_RESERVED_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Host variables eligible for copying into the guest, in key order.
    ///
    /// Entries whose key or value is not valid UTF-8 are skipped since the
    /// guest environment is expressed as `--setenv` text.
    #[must_use]
    pub fn forwarded(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .filter(|(key, _)| has_prefix(key, FORWARDED_ENV_PREFIX))
            .filter_map(|(key, value)| {
                Some((key.to_str()?.to_owned(), value.to_str()?.to_owned()))
            })
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for HostEnvironment
where
    K: Into<OsString>,
    V: Into<OsString>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn has_prefix(key: &OsStr, prefix: &str) -> bool {
    key.as_encoded_bytes().starts_with(prefix.as_bytes())
}
