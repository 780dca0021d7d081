//! Forwarding of host descriptors into the container.
//!
//! Forwarded descriptors land on guest descriptors 3, 4, … in the order they
//! were requested. The runtime only passes descriptors announced through the
//! socket-activation variables, and those must name the pid that ends up
//! executing the runtime.
//!
//! Without a privilege wrapper the descriptors are remapped between `fork`
//! and `exec`, and a tiny shell trampoline exports the variables under its
//! own pid before `exec`ing onwards. A wrapper such as `sudo` closes every
//! inherited descriptor above standard error, so that path goes through
//! [`crate::inject`] instead.

use std::ffi::OsString;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use nix::fcntl::{FcntlArg, fcntl};
use nix::unistd::dup2;

use crate::options::FORWARDED_FD_BASE;

/// Spawns a composed runtime command with host descriptors remapped.
#[cfg_attr(test, mockall::automock)]
pub trait DescriptorForwarder {
    /// Spawns `command` so that `fds[i]` is open as descriptor
    /// `FORWARDED_FD_BASE + i` in the child.
    fn spawn_forwarding(&self, command: Command, fds: &[RawFd]) -> io::Result<Child>;
}

/// Maps descriptors with `dup2` between `fork` and `exec`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialForwarder;

impl DescriptorForwarder for SequentialForwarder {
    fn spawn_forwarding(&self, mut command: Command, fds: &[RawFd]) -> io::Result<Child> {
        let sources: Vec<RawFd> = fds.to_vec();
        let mut staged: Vec<RawFd> = vec![-1; sources.len()];
        let floor = first_free_descriptor(sources.len())?;
        // SAFETY: the closure only issues `fcntl` and `dup2` system calls and
        // writes into a buffer allocated before `fork`.
        unsafe {
            command.pre_exec(move || {
                remap_descriptors(&sources, &mut staged, floor).map_err(io::Error::from)
            });
        }
        command.spawn()
    }
}

/// First descriptor above the forwarded range.
///
/// # Errors
///
/// Fails when `count` forwarded descriptors do not fit in a descriptor number.
pub fn first_free_descriptor(count: usize) -> io::Result<RawFd> {
    RawFd::try_from(count)
        .ok()
        .and_then(|count| FORWARDED_FD_BASE.checked_add(count))
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "too many forwarded descriptors")
        })
}

/// Arguments that announce `count` descriptors to the runtime.
///
/// The returned prefix is placed in front of the runtime argv; the shell
/// exports the variables under its own pid and then replaces itself.
#[must_use]
pub fn listen_fds_trampoline(count: usize) -> Vec<OsString> {
    vec![
        OsString::from("/bin/sh"),
        OsString::from("-c"),
        OsString::from(format!(
            "export LISTEN_FDS={count} LISTEN_PID=$$; unset LISTEN_FDNAMES; exec \"$@\""
        )),
        OsString::from("sh"),
    ]
}

/// Moves `sources` onto `FORWARDED_FD_BASE..` in the calling process.
///
/// Targets are left inheritable; the sources themselves are not closed.
pub(crate) fn install_forwarded(sources: &[RawFd]) -> io::Result<()> {
    let mut staged: Vec<RawFd> = vec![-1; sources.len()];
    let floor = first_free_descriptor(sources.len())?;
    remap_descriptors(sources, &mut staged, floor).map_err(io::Error::from)
}

fn remap_descriptors(sources: &[RawFd], staged: &mut [RawFd], floor: RawFd) -> nix::Result<()> {
    // Two passes: a source may already occupy a target slot.
    for (slot, source) in staged.iter_mut().zip(sources) {
        *slot = fcntl(*source, FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    }
    // `dup2` clears close-on-exec on each target.
    for (target, duplicate) in (FORWARDED_FD_BASE..).zip(staged.iter()) {
        dup2(*duplicate, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::process::Stdio;

    use super::*;

    #[test]
    fn forwarded_descriptor_is_readable_at_base() {
        let mut file = tempfile::tempfile().expect("tempfile");
        std::io::Write::write_all(&mut file, b"forwarded").expect("write");
        std::io::Seek::rewind(&mut file).expect("rewind");

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg("cat <&3")
            .stdout(Stdio::piped());
        let mut child = SequentialForwarder
            .spawn_forwarding(command, &[file.as_raw_fd()])
            .expect("spawn");
        let mut stdout = String::new();
        child
            .stdout
            .take()
            .expect("stdout")
            .read_to_string(&mut stdout)
            .expect("read stdout");
        assert!(child.wait().expect("wait").success());
        assert_eq!(stdout, "forwarded");
    }

    #[test]
    fn trampoline_exports_count() {
        let mut command = Command::new(&listen_fds_trampoline(2)[0]);
        command
            .args(&listen_fds_trampoline(2)[1..])
            .arg("/bin/sh")
            .arg("-c")
            .arg("echo \"$LISTEN_FDS\"")
            .stdout(Stdio::piped());
        let output = command.output().expect("run trampoline");
        assert_eq!(String::from_utf8_lossy(&output.stdout), "2\n");
    }

    #[test]
    fn first_free_descriptor_follows_forwarded_range() {
        assert_eq!(first_free_descriptor(0).expect("zero"), FORWARDED_FD_BASE);
        assert_eq!(first_free_descriptor(2).expect("two"), FORWARDED_FD_BASE + 2);
    }
}
