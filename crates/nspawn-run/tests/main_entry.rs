//! Integration tests for the `nspawn-run` binary entry point.

use std::io::{Seek, Write};
use std::os::fd::AsRawFd;
use std::process::{Command, Stdio};
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use netns_handoff::{Rendezvous, send_descriptor_batch};
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn help_hides_the_helper_subcommands() {
    let mut command = cargo_bin_cmd!("nspawn-run");
    command.arg("--help");
    command.assert().success().stdout(
        contains("serve-repos")
            .and(contains("send-sockets").not())
            .and(contains("receive-fds").not()),
    );
}

#[test]
fn missing_subcommand_exits_with_failure() {
    let mut command = cargo_bin_cmd!("nspawn-run");
    command.assert().failure().stderr(contains("error:"));
}

#[test]
fn quiet_with_debug_is_rejected() {
    let mut command = cargo_bin_cmd!("nspawn-run");
    command.args(["run", "--layer", "/nonexistent", "--quiet", "--debug"]);
    command
        .assert()
        .failure()
        .stderr(contains("cannot be combined with verbose debug logging"));
}

#[test]
fn serve_repos_without_a_port_list_fails() {
    let scratch = TempDir::new().expect("scratch dir");
    let snapshot = TempDir::new().expect("snapshot dir");
    let mut command = cargo_bin_cmd!("nspawn-run");
    command
        .arg("--scratch-dir")
        .arg(scratch.path())
        .args(["serve-repos", "--target-pid", "1", "--snapshot-dir"])
        .arg(snapshot.path());
    command
        .assert()
        .failure()
        .stderr(contains("repo_server_ports"));
}

#[test]
fn courier_hands_sockets_over_its_inherited_listener() {
    let scratch = TempDir::new().expect("scratch dir");
    let (rendezvous, channel) = Rendezvous::open(scratch.path()).expect("rendezvous");
    let mut courier = Command::new(env!("CARGO_BIN_EXE_nspawn-run"))
        .args(["send-sockets", "--count", "2", "--listen-fd", "1"])
        .args(["--timeout-ms", "5000"])
        .stdin(Stdio::null())
        .stdout(Stdio::from(channel))
        .stderr(Stdio::inherit())
        .spawn()
        .expect("courier starts");

    let received = rendezvous
        .receive(2, Duration::from_secs(5))
        .expect("batch received");
    assert_eq!(received.len(), 2);
    assert!(courier.wait().expect("courier exits").success());
}

#[test]
fn courier_rejects_a_closed_descriptor() {
    let mut command = cargo_bin_cmd!("nspawn-run");
    command.args(["send-sockets", "--count", "1", "--listen-fd", "987"]);
    command
        .assert()
        .failure()
        .stderr(contains("descriptor 987 is not open"));
}

#[test]
fn receiver_installs_descriptors_and_becomes_the_runtime() {
    let scratch = TempDir::new().expect("scratch dir");
    let (rendezvous, channel) = Rendezvous::open(scratch.path()).expect("rendezvous");
    let mut payload = tempfile::tempfile().expect("payload file");
    payload.write_all(b"carried").expect("write payload");
    payload.rewind().expect("rewind payload");

    let receiver = Command::new(env!("CARGO_BIN_EXE_nspawn-run"))
        .arg("receive-fds")
        .arg("--rendezvous")
        .arg(rendezvous.path())
        .args(["--count", "1", "--timeout-ms", "5000", "--"])
        .args(["/bin/sh", "-c", r#"cat <&3; echo " $LISTEN_FDS $LISTEN_PID $$""#])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("receiver starts");
    let pid = receiver.id();

    send_descriptor_batch(channel, &[payload.as_raw_fd()], Duration::from_secs(5))
        .expect("descriptor delivered");
    let output = receiver.wait_with_output().expect("runtime exits");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        format!("carried 1 {pid} {pid}\n")
    );
}

#[test]
fn receiver_without_a_sender_times_out() {
    let scratch = TempDir::new().expect("scratch dir");
    let mut command = cargo_bin_cmd!("nspawn-run");
    command
        .arg("receive-fds")
        .arg("--rendezvous")
        .arg(scratch.path().join("absent.sock"))
        .args(["--count", "1", "--timeout-ms", "100", "--", "/bin/true"]);
    command.assert().failure().stderr(contains("error:"));
}
