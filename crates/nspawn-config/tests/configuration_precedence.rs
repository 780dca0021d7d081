use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8PathBuf;
use once_cell::sync::Lazy;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;
use ortho_config::OrthoConfig;

use nspawn_config::{
    Config, DEFAULT_HANDOFF_TIMEOUT_MS, DEFAULT_READINESS_POLL_MS, DEFAULT_REPO_SERVER_BINARY,
    default_log_filter, default_log_format,
};

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct Harness {
    temp_dir: TempDir,
    cli_args: RefCell<Vec<OsString>>,
    env_overrides: RefCell<Vec<(String, Option<OsString>)>>,
    loaded: RefCell<Option<Config>>,
    error: RefCell<Option<String>>,
    _guard: MutexGuard<'static, ()>,
}

impl Harness {
    fn new() -> Self {
        let guard = ENV_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let temp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("failed to create temporary directory: {error}"),
        };
        Self {
            temp_dir,
            cli_args: RefCell::new(vec![OsString::from("nspawn-run")]),
            env_overrides: RefCell::new(Vec::new()),
            loaded: RefCell::new(None),
            error: RefCell::new(None),
            _guard: guard,
        }
    }

    fn write_config(&self, repo_server: &str) {
        let path = self.temp_dir.path().join("nspawn.toml");
        let toml = format!("repo_server_binary = \"{repo_server}\"\nreadiness_poll_ms = 250\n");
        if let Err(error) = fs::write(&path, toml) {
            panic!("failed to write configuration: {error}");
        }

        let mut args = self.cli_args.borrow_mut();
        args.push(OsString::from("--config-path"));
        args.push(path.into_os_string());
    }

    fn set_env(&self, key: &str, value: &str) {
        let previous = std::env::var_os(key);
        // Environment mutation is unsafe under edition 2024. The harness holds
        // the process-wide mutex and restores overrides in `Drop`.
        unsafe { std::env::set_var(key, value) };
        self.env_overrides
            .borrow_mut()
            .push((key.to_owned(), previous));
    }

    fn push_cli_arg(&self, arg: impl Into<OsString>) {
        self.cli_args.borrow_mut().push(arg.into());
    }

    fn load(&self) {
        if self.loaded.borrow().is_some() || self.error.borrow().is_some() {
            return;
        }

        let args = self.cli_args.borrow().clone();
        match Config::load_from_iter(args) {
            Ok(config) => {
                *self.loaded.borrow_mut() = Some(config);
            }
            Err(error) => {
                *self.error.borrow_mut() = Some(error.to_string());
            }
        }
    }

    fn loaded_config(&self) -> Config {
        self.load();
        if let Some(error) = self.error.borrow().as_ref() {
            panic!("configuration failed to load: {error}");
        }
        match self.loaded.borrow().as_ref() {
            Some(config) => config.clone(),
            None => panic!("configuration was not loaded"),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let mut overrides = self.env_overrides.borrow_mut();
        while let Some((key, value)) = overrides.pop() {
            if let Some(os_value) = value {
                unsafe { std::env::set_var(&key, os_value) };
            } else {
                unsafe { std::env::remove_var(&key) };
            }
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[given("a configuration file setting the repo server binary to \"{path}\"")]
fn given_configuration_file(harness: &Harness, path: String) {
    harness.write_config(&path);
}

#[given("the environment overrides the repo server binary to \"{path}\"")]
fn given_environment_override(harness: &Harness, path: String) {
    harness.set_env("NSPAWN_REPO_SERVER_BINARY", &path);
}

#[when("the CLI sets the repo server binary to \"{path}\"")]
fn when_cli_override(harness: &Harness, path: String) {
    harness.push_cli_arg("--repo-server-binary");
    harness.push_cli_arg(OsString::from(&path));
}

#[when("the configuration loads without overrides")]
fn when_load_without_overrides(harness: &Harness) {
    harness.load();
}

#[then("loading the configuration resolves the repo server binary to \"{path}\"")]
fn then_resolved_repo_server(harness: &Harness, path: String) {
    let config = harness.loaded_config();
    assert_eq!(config.repo_server_binary(), Utf8PathBuf::from(path).as_path());
    assert_eq!(config.readiness_poll_ms, 250, "file layer still applies");
}

#[then("loading the configuration applies the built-in defaults")]
fn then_defaults_applied(harness: &Harness) {
    let config = harness.loaded_config();
    assert_eq!(config.log_filter(), default_log_filter());
    assert_eq!(config.log_format(), default_log_format());
    assert_eq!(config.repo_server_binary().as_str(), DEFAULT_REPO_SERVER_BINARY);
    assert_eq!(config.handoff_timeout_ms, DEFAULT_HANDOFF_TIMEOUT_MS);
    assert_eq!(config.readiness_poll_ms, DEFAULT_READINESS_POLL_MS);
    assert!(config.scratch_dir().is_none());
    assert!(config.snapshot_dir().is_none(), "snapshots sit beside the layer");
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Built-in defaults apply without overrides"
)]
fn defaults_apply(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "The configuration file sets the repo server binary"
)]
fn file_layer(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "The environment overrides the configuration file"
)]
fn environment_layer(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "The command line overrides the environment"
)]
fn cli_layer(#[from(harness)] harness: Harness) {
    drop(harness);
}
