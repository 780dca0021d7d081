//! Unit tests for option validation and invocation building.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::Path;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use crate::environment::HostEnvironment;
use crate::error::ConfigurationError;
use crate::host::HostContext;
use crate::invocation::{InstanceId, InvocationInputs, colon_quote, resolve_invocation};
use crate::options::{DebugOptions, EnvAssignment, SandboxConfig, SnapshotMode, TargetUser};
use crate::snapshot::Subvolume;

const PINNED: u128 = 0x0123_4567_89ab_cdef_0123_4567_89ab_cdef;

struct Layer {
    _dir: TempDir,
    subvolume: Subvolume,
}

#[fixture]
fn layer() -> Layer {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("volume");
    fs::create_dir_all(root.join("etc")).expect("etc");
    fs::write(root.join("etc/os-release"), "ID=test\n").expect("os-release");
    Layer {
        subvolume: Subvolume::new(root),
        _dir: dir,
    }
}

fn resolve(config: &SandboxConfig, host: &HostContext, requires_repo: bool) -> Vec<String> {
    let inputs = InvocationInputs {
        root: config.layer(),
        layer_requires_repo: requires_repo,
        instance: InstanceId::pinned(PINNED),
        nspawn_binary: OsStr::new("systemd-nspawn"),
    };
    resolve_invocation(config, host, &inputs)
        .argv()
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn position(argv: &[String], needle: &str) -> usize {
    argv.iter()
        .position(|arg| arg == needle)
        .unwrap_or_else(|| panic!("{needle} missing from {argv:?}"))
}

#[test]
fn empty_command_is_rejected() {
    let error = SandboxConfig::builder(Subvolume::new("/layer"), Vec::<OsString>::new())
        .build()
        .expect_err("empty command must fail");
    assert_eq!(error, ConfigurationError::EmptyCommand);
}

#[test]
fn quiet_with_verbose_is_rejected() {
    let error = SandboxConfig::builder(Subvolume::new("/layer"), ["true"])
        .quiet()
        .debug_options_not_for_production(DebugOptions::not_for_production().verbose().build())
        .build()
        .expect_err("quiet and verbose must fail");
    assert_eq!(error, ConfigurationError::QuietWithVerbose);
}

#[test]
fn persisted_snapshot_requires_snapshot_mode() {
    let error = SandboxConfig::builder(Subvolume::new("/layer"), ["true"])
        .without_snapshot()
        .debug_options_not_for_production(
            DebugOptions::not_for_production().snapshot_into("/keep").build(),
        )
        .build()
        .expect_err("persisting without snapshot must fail");
    assert!(matches!(error, ConfigurationError::PersistWithoutSnapshot { .. }));
}

#[test]
fn duplicate_forwarded_descriptor_is_rejected() {
    let error = SandboxConfig::builder(Subvolume::new("/layer"), ["true"])
        .forward_fd(5)
        .forward_fd(6)
        .forward_fd(5)
        .build()
        .expect_err("duplicate descriptor must fail");
    assert_eq!(error, ConfigurationError::DuplicateForwardedFd { fd: 5 });
}

#[rstest]
#[case("=value")]
#[case("novalue")]
fn malformed_assignments_are_rejected(#[case] raw: &str) {
    assert!(raw.parse::<EnvAssignment>().is_err());
}

#[test]
fn assignment_value_may_contain_equals() {
    let assignment: EnvAssignment = "A=b=c".parse().expect("assignment");
    assert_eq!(assignment.key(), "A");
    assert_eq!(assignment.value(), "b=c");
}

#[test]
fn setenv_with_empty_key_fails_at_build() {
    let error = SandboxConfig::builder(Subvolume::new("/layer"), ["true"])
        .setenv("", "x")
        .build()
        .expect_err("empty key must fail");
    assert!(matches!(error, ConfigurationError::MalformedAssignment(_)));
}

#[test]
fn defaults_are_production_safe() {
    let config = SandboxConfig::builder(Subvolume::new("/layer"), ["true"])
        .build()
        .expect("config");
    let debug = config.debug_options();
    assert_eq!(config.snapshot(), SnapshotMode::Ephemeral);
    assert_eq!(config.user(), &TargetUser::nobody());
    assert!(debug.private_network());
    assert!(debug.logs_tmpfs());
    assert!(!debug.forward_tls_env());
    assert!(!debug.cap_net_admin());
    assert!(debug.snapshot_into().is_none());
}

#[rstest]
fn pinned_instance_makes_invocation_deterministic(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["/bin/echo", "hi"])
        .hostname("box")
        .build()
        .expect("config");
    let host = HostContext::new(HostEnvironment::default());
    assert_eq!(resolve(&config, &host, false), resolve(&config, &host, false));
}

#[rstest]
fn hardening_flags_precede_extras(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["/bin/echo", "hi"])
        .quiet()
        .hostname("box")
        .build()
        .expect("config");
    let argv = resolve(&config, &HostContext::default(), false);

    assert_eq!(&argv[..3], ["env", "UNIFIED_CGROUP_HIERARCHY=yes", "systemd-nspawn"]);
    assert_eq!(&argv[3..5], ["--register=no", "--keep-unit"]);
    assert_eq!(argv[position(&argv, "--machine") + 1], format!("{:032x}", PINNED));
    assert_eq!(
        argv[position(&argv, "--directory") + 1],
        layer.subvolume.path().display().to_string()
    );
    let timezone = position(&argv, "--timezone=off");
    assert!(position(&argv, "--link-journal=no") < timezone);
    assert!(timezone < position(&argv, "--quiet"));
    assert!(position(&argv, "--quiet") < position(&argv, "--private-network"));
    assert!(position(&argv, "--hostname=box") < position(&argv, "--drop-capability=CAP_MKNOD"));
    assert!(!argv.iter().any(|arg| arg.contains("os-release")));
}

#[test]
fn missing_os_release_gets_placeholder() {
    let dir = TempDir::new().expect("tempdir");
    let config = SandboxConfig::builder(Subvolume::new(dir.path()), ["true"])
        .build()
        .expect("config");
    let argv = resolve(&config, &HostContext::default(), false);
    let bind = position(&argv, "/dev/null:/usr/lib/os-release");
    assert_eq!(argv[bind - 1], "--bind-ro");
    assert!(bind < position(&argv, "--link-journal=no"));
}

#[rstest]
fn guest_section_runs_as_pid2_under_target_user(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["/bin/echo", "hi"])
        .setenv("A", "1")
        .user(TargetUser::root())
        .build()
        .expect("config");
    let argv = resolve(&config, &HostContext::default(), false);
    let tail = &argv[position(&argv, "--as-pid2")..];
    assert_eq!(tail, ["--as-pid2", "--user=root", "--setenv=A=1", "--", "/bin/echo", "hi"]);
}

#[rstest]
fn bind_mounts_are_quoted_and_ordered(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["true"])
        .bindmount_ro("/host/ro:1", "/guest/ro")
        .bindmount_rw("/host/rw\\x", "/guest/rw")
        .build()
        .expect("config");
    let argv = resolve(&config, &HostContext::default(), false);
    let rw = position(&argv, "/host/rw\\\\x:/guest/rw");
    let ro = position(&argv, "/host/ro\\:1:/guest/ro");
    assert_eq!(argv[rw - 1], "--bind");
    assert_eq!(argv[ro - 1], "--bind-ro");
    assert!(rw < ro, "read-write binds come first");
}

#[test]
fn colon_quote_escapes_backslash_and_colon() {
    assert_eq!(colon_quote(OsStr::new("a:b\\c")), OsString::from("a\\:b\\\\c"));
}

#[rstest]
#[case(true, false)]
#[case(false, true)]
fn repo_root_is_bound_when_flag_or_metadata_asks(
    layer: Layer,
    #[case] flag: bool,
    #[case] metadata: bool,
) {
    let mut builder = SandboxConfig::builder(layer.subvolume.clone(), ["true"]);
    if flag {
        builder = builder.bind_repo_ro();
    }
    let config = builder.build().expect("config");
    let host = HostContext::default().with_repo_root("/repo");
    let argv = resolve(&config, &host, metadata);
    assert_eq!(argv[position(&argv, "/repo:/repo") - 1], "--bind-ro");
}

#[rstest]
fn repo_root_is_not_bound_by_default(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["true"])
        .build()
        .expect("config");
    let host = HostContext::default().with_repo_root("/repo");
    assert!(!resolve(&config, &host, false).contains(&String::from("/repo:/repo")));
}

#[rstest]
fn logs_tmpfs_is_owned_by_target_user(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["true"])
        .user(TargetUser::new("builder", 1000, 1001))
        .build()
        .expect("config");
    let argv = resolve(&config, &HostContext::default(), false);
    assert!(argv.contains(&String::from(
        "--tmpfs=/logs:uid=1000,gid=1001,mode=0755,nodev,nosuid,noexec"
    )));
}

#[rstest]
fn debug_knobs_change_network_and_capabilities(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["true"])
        .allow_mknod()
        .debug_options_not_for_production(
            DebugOptions::not_for_production()
                .share_host_network()
                .cap_net_admin()
                .without_logs_tmpfs()
                .build(),
        )
        .build()
        .expect("config");
    let host = HostContext::default().with_fuse_device(true);
    let argv = resolve(&config, &host, false);
    assert!(!argv.contains(&String::from("--private-network")));
    assert!(!argv.contains(&String::from("--drop-capability=CAP_MKNOD")));
    assert!(!argv.iter().any(|arg| arg.starts_with("--tmpfs=")));
    assert!(argv.contains(&String::from("--capability=CAP_NET_ADMIN")));
    assert!(argv.contains(&String::from("--bind-ro=/dev/fuse")));
}

#[rstest]
fn explicit_settings_override_forwarded_tls_variables(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["true"])
        .setenv("THRIFT_TLS_CL_CERT_PATH", "/explicit.pem")
        .setenv("B", "1")
        .setenv("B", "2")
        .debug_options_not_for_production(
            DebugOptions::not_for_production().forward_tls_env().build(),
        )
        .build()
        .expect("config");
    let environment: HostEnvironment = [
        ("THRIFT_TLS_CL_CERT_PATH", "/host.pem"),
        ("THRIFT_TLS_CL_KEY_PATH", "/host.key"),
        ("HOME", "/x"),
    ]
    .into_iter()
    .collect();
    let host = HostContext::new(environment);
    let inputs = InvocationInputs {
        root: config.layer(),
        layer_requires_repo: false,
        instance: InstanceId::pinned(PINNED),
        nspawn_binary: OsStr::new("systemd-nspawn"),
    };
    let invocation = resolve_invocation(&config, &host, &inputs);
    let rendered: Vec<String> = invocation
        .command_env()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        rendered,
        [
            "THRIFT_TLS_CL_CERT_PATH=/explicit.pem",
            "THRIFT_TLS_CL_KEY_PATH=/host.key",
            "B=2",
        ]
    );
}

#[rstest]
fn tls_variables_stay_on_host_by_default(layer: Layer) {
    let config = SandboxConfig::builder(layer.subvolume.clone(), ["true"])
        .build()
        .expect("config");
    let host = HostContext::new([("THRIFT_TLS_X", "1")].into_iter().collect());
    let argv = resolve(&config, &host, false);
    assert!(!argv.iter().any(|arg| arg.contains("THRIFT_TLS_X")));
}

#[test]
fn runtime_environment_is_sanitized() {
    let environment: HostEnvironment = [("SYSTEMD_NSPAWN_FOO", "bar"), ("HOME", "/x")]
        .into_iter()
        .collect();
    let config = SandboxConfig::builder(Subvolume::new("/layer"), ["true"])
        .build()
        .expect("config");
    let host = HostContext::new(environment);
    let inputs = InvocationInputs {
        root: config.layer(),
        layer_requires_repo: false,
        instance: InstanceId::random(),
        nspawn_binary: OsStr::new("systemd-nspawn"),
    };
    let invocation = resolve_invocation(&config, &host, &inputs);
    assert_eq!(invocation.runtime_env().get("SYSTEMD_NSPAWN_FOO"), None);
    assert_eq!(invocation.runtime_env().get("HOME"), Some(Path::new("/x").as_os_str()));
}
