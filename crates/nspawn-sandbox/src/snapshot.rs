//! Filesystem snapshot seam and its btrfs-backed implementation.
//!
//! The sandbox only ever asks a [`SnapshotStore`] to clone a subvolume,
//! replicate the mounts found under it, and delete a clone it created. The
//! copy-on-write semantics live entirely behind that trait.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use nix::sys::statfs::{BTRFS_SUPER_MAGIC, statfs};
use tracing::debug;

use crate::error::SnapshotError;

const SNAPSHOT_TARGET: &str = "nspawn_sandbox::snapshot";
const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
const REQUIRES_REPO_METADATA: &str = "meta/private/opts/artifacts_may_require_repo";

/// Handle to a filesystem tree that can host a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subvolume {
    path: PathBuf,
}

impl Subvolume {
    /// Wraps the host path of a subvolume.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Host path of the subvolume root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves an image-absolute path such as `/etc/os-release` on the host.
    #[must_use]
    pub fn path_in_image(&self, image_path: impl AsRef<Path>) -> PathBuf {
        let image_path = image_path.as_ref();
        let relative = image_path.strip_prefix("/").unwrap_or(image_path);
        self.path.join(relative)
    }

    /// Name for scratch clones, chosen to resemble the source.
    ///
    /// Built layers live at `<layer-name>/volume`, so the parent directory is
    /// the informative component; bare directories fall back to their own
    /// name.
    #[must_use]
    pub fn scratch_name(&self) -> String {
        let normal: PathBuf = self
            .path
            .components()
            .filter(|component| !matches!(component, Component::CurDir))
            .collect();
        normal
            .parent()
            .and_then(Path::file_name)
            .or_else(|| normal.file_name())
            .map_or_else(
                || String::from("subvolume"),
                |name| name.to_string_lossy().into_owned(),
            )
    }
}

/// Copy-on-write snapshot primitive used by the lifecycle manager.
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotStore {
    /// Clones `source` into the non-existent `destination`.
    fn clone_subvolume(
        &self,
        source: &Subvolume,
        destination: &Path,
    ) -> Result<Subvolume, SnapshotError>;

    /// Replicates mounts active under `source` into `destination`.
    fn clone_mounts(&self, source: &Subvolume, destination: &Subvolume)
    -> Result<(), SnapshotError>;

    /// Deletes a clone previously produced by [`Self::clone_subvolume`].
    fn delete(&self, subvolume: &Subvolume) -> Result<(), SnapshotError>;
}

/// Reads build-time metadata recorded inside a layer.
#[cfg_attr(test, mockall::automock)]
pub trait LayerMetadata {
    /// Whether binaries in the layer may need the repository mounted.
    fn artifacts_may_require_repo(&self, layer: &Subvolume) -> Result<bool, SnapshotError>;
}

/// Metadata reader for the integer files layers carry under `meta`.
///
/// Layers built without that metadata are treated as not needing the repo.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetaDirectory;

impl LayerMetadata for MetaDirectory {
    fn artifacts_may_require_repo(&self, layer: &Subvolume) -> Result<bool, SnapshotError> {
        let path = layer.path_in_image(REQUIRES_REPO_METADATA);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(SnapshotError::Metadata { path, source }),
        };
        let value = content.trim();
        value
            .parse::<i64>()
            .map(|flag| flag != 0)
            .map_err(|_| SnapshotError::MalformedMetadata {
                path,
                value: value.to_owned(),
            })
    }
}

/// [`SnapshotStore`] driving `btrfs subvolume` and `mount` via a privilege
/// wrapper.
#[derive(Debug, Clone)]
pub struct BtrfsSnapshotStore {
    wrapper: Vec<OsString>,
    btrfs: OsString,
}

impl BtrfsSnapshotStore {
    /// Creates a store that runs its tools through `wrapper` (e.g. `sudo`).
    #[must_use]
    pub fn new<I, S>(wrapper: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            wrapper: wrapper.into_iter().map(Into::into).collect(),
            btrfs: OsString::from("btrfs"),
        }
    }

    /// Overrides the `btrfs` executable.
    #[must_use]
    pub fn with_btrfs(mut self, btrfs: impl Into<OsString>) -> Self {
        self.btrfs = btrfs.into();
        self
    }

    fn run_tool(
        &self,
        program: &OsStr,
        args: &[&OsStr],
        action: &'static str,
    ) -> Result<(), SnapshotError> {
        let mut argv: Vec<&OsStr> = self.wrapper.iter().map(OsString::as_os_str).collect();
        argv.push(program);
        argv.extend_from_slice(args);
        let Some((head, tail)) = argv.split_first() else {
            return Ok(());
        };
        debug!(target: SNAPSHOT_TARGET, ?argv, action, "running snapshot tool");
        let status = Command::new(head).args(tail).status().map_err(|source| {
            SnapshotError::ToolSpawn {
                program: program.to_string_lossy().into_owned(),
                action,
                source,
            }
        })?;
        if status.success() {
            return Ok(());
        }
        Err(SnapshotError::ToolFailed {
            program: program.to_string_lossy().into_owned(),
            action,
            status,
        })
    }
}

impl SnapshotStore for BtrfsSnapshotStore {
    fn clone_subvolume(
        &self,
        source: &Subvolume,
        destination: &Path,
    ) -> Result<Subvolume, SnapshotError> {
        if destination.exists() {
            return Err(SnapshotError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }
        self.run_tool(
            &self.btrfs,
            &[
                OsStr::new("subvolume"),
                OsStr::new("snapshot"),
                source.path().as_os_str(),
                destination.as_os_str(),
            ],
            "cloning a subvolume",
        )
        .map_err(|error| diagnose_clone_failure(error, destination))?;
        Ok(Subvolume::new(destination))
    }

    fn clone_mounts(
        &self,
        source: &Subvolume,
        destination: &Subvolume,
    ) -> Result<(), SnapshotError> {
        let table = read_mount_table()?;
        for mount_point in mount_points_under(&table, source.path()) {
            let Ok(relative) = mount_point.strip_prefix(source.path()) else {
                continue;
            };
            let target = destination.path().join(relative);
            self.run_tool(
                OsStr::new("mount"),
                &[
                    OsStr::new("-o"),
                    OsStr::new("bind,ro"),
                    mount_point.as_os_str(),
                    target.as_os_str(),
                ],
                "cloning a mount",
            )?;
        }
        Ok(())
    }

    fn delete(&self, subvolume: &Subvolume) -> Result<(), SnapshotError> {
        let table = read_mount_table()?;
        for mount_point in mount_points_under(&table, subvolume.path()).iter().rev() {
            self.run_tool(
                OsStr::new("umount"),
                &[OsStr::new("--recursive"), mount_point.as_os_str()],
                "unmounting a cloned mount",
            )?;
        }
        self.run_tool(
            &self.btrfs,
            &[
                OsStr::new("subvolume"),
                OsStr::new("delete"),
                subvolume.path().as_os_str(),
            ],
            "deleting a subvolume",
        )
    }
}

/// A failed snapshot whose destination is not on btrfs can never succeed;
/// say so instead of reporting the tool's exit status.
fn diagnose_clone_failure(error: SnapshotError, destination: &Path) -> SnapshotError {
    let Some(parent) = destination.parent() else {
        return error;
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    match is_btrfs(parent) {
        Ok(false) => SnapshotError::NotBtrfs {
            path: parent.to_path_buf(),
        },
        Ok(true) | Err(_) => error,
    }
}

pub(crate) fn is_btrfs(path: &Path) -> nix::Result<bool> {
    Ok(statfs(path)?.filesystem_type() == BTRFS_SUPER_MAGIC)
}

fn read_mount_table() -> Result<String, SnapshotError> {
    fs::read_to_string(MOUNTINFO_PATH).map_err(|source| SnapshotError::MountTable { source })
}

/// Lists mount points strictly below `root`, parents before children.
pub(crate) fn mount_points_under(mountinfo: &str, root: &Path) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .filter(|mount_point| mount_point != root && mount_point.starts_with(root))
        .collect()
}

/// Decodes the octal escapes (`\040` and friends) used by the kernel.
fn unescape_mount_field(field: &str) -> String {
    let mut decoded = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            decoded.push(ch);
            continue;
        }
        let digits: String = (0..3).filter_map(|_| chars.next_if(char::is_ascii_digit)).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) if digits.len() == 3 => decoded.push(char::from(byte)),
            _ => {
                decoded.push('\\');
                decoded.push_str(&digits);
            }
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const MOUNTINFO: &str = "\
22 1 0:21 / / rw,relatime shared:1 - btrfs /dev/sda1 rw
40 22 0:30 / /layers/base/volume rw shared:2 - btrfs /dev/sda1 rw
41 40 0:31 / /layers/base/volume/mnt/repo ro shared:3 - btrfs /dev/sda1 ro
42 40 0:32 / /layers/base/volume/mnt/with\\040space ro shared:4 - btrfs /dev/sda1 ro
43 22 0:33 / /layers/base/volume-other rw shared:5 - btrfs /dev/sda1 rw
";

    #[test]
    fn mount_points_exclude_root_and_siblings() {
        let mounts = mount_points_under(MOUNTINFO, Path::new("/layers/base/volume"));
        assert_eq!(
            mounts,
            vec![
                PathBuf::from("/layers/base/volume/mnt/repo"),
                PathBuf::from("/layers/base/volume/mnt/with space"),
            ]
        );
    }

    #[rstest]
    #[case("/layers/hello/volume", "hello")]
    #[case("/layers/hello/./volume", "hello")]
    #[case("volume", "volume")]
    fn scratch_name_resembles_source(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(Subvolume::new(path).scratch_name(), expected);
    }

    #[test]
    fn path_in_image_strips_leading_slash() {
        let subvolume = Subvolume::new("/layers/a/volume");
        assert_eq!(
            subvolume.path_in_image("/etc/os-release"),
            PathBuf::from("/layers/a/volume/etc/os-release")
        );
    }

    #[rstest]
    #[case("1\n", true)]
    #[case("0\n", false)]
    fn meta_directory_reads_repo_flag(#[case] content: &str, #[case] expected: bool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = dir.path().join("meta/private/opts");
        fs::create_dir_all(&meta).expect("meta dir");
        fs::write(meta.join("artifacts_may_require_repo"), content).expect("write flag");
        let layer = Subvolume::new(dir.path());
        let flag = MetaDirectory
            .artifacts_may_require_repo(&layer)
            .expect("flag should parse");
        assert_eq!(flag, expected);
    }

    #[test]
    fn meta_directory_defaults_to_false_when_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layer = Subvolume::new(dir.path());
        assert!(!MetaDirectory
            .artifacts_may_require_repo(&layer)
            .expect("missing metadata is not an error"));
    }

    #[test]
    fn meta_directory_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = dir.path().join("meta/private/opts");
        fs::create_dir_all(&meta).expect("meta dir");
        fs::write(meta.join("artifacts_may_require_repo"), "yes").expect("write flag");
        let error = MetaDirectory
            .artifacts_may_require_repo(&Subvolume::new(dir.path()))
            .expect_err("garbage should be rejected");
        assert!(matches!(error, SnapshotError::MalformedMetadata { .. }));
    }

    #[test]
    fn failed_clone_outside_btrfs_names_the_filesystem_problem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BtrfsSnapshotStore::new(Vec::<OsString>::new()).with_btrfs("false");
        let error = store
            .clone_subvolume(&Subvolume::new("/layers/a/volume"), &dir.path().join("clone"))
            .expect_err("the tool fails");
        if is_btrfs(dir.path()).expect("statfs on tempdir") {
            assert!(matches!(error, SnapshotError::ToolFailed { .. }));
        } else {
            assert!(
                matches!(&error, SnapshotError::NotBtrfs { path } if path == dir.path()),
                "unexpected error: {error}"
            );
        }
    }

    #[test]
    fn clone_refuses_existing_destination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BtrfsSnapshotStore::new(Vec::<OsString>::new());
        let error = store
            .clone_subvolume(&Subvolume::new("/nonexistent"), dir.path())
            .expect_err("existing destination must be rejected");
        assert!(matches!(error, SnapshotError::DestinationExists { .. }));
    }
}
