//! Disk images handed to QEMU as inherited file descriptors.
//!
//! Images are opened close-on-exec like every other descriptor in this
//! process. Only the QEMU child gets them, remapped onto fixed numbers
//! starting at [`FIRST_DISK_FD`] by [`pass_to_child`].

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use fleet::{DiskSource, DiskSpec, FleetError};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::command::{CommandError, exec};

/// Descriptor number the first disk gets in the child; the rest follow.
pub const FIRST_DISK_FD: RawFd = 3;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("backing file {path}: {detail}")]
    Backing { path: PathBuf, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DiskError> for FleetError {
    fn from(e: DiskError) -> Self {
        match e {
            DiskError::Command(e) => e.into(),
            DiskError::Io(e) => FleetError::Io(e),
            other => FleetError::DiskSpec(other.to_string()),
        }
    }
}

/// A materialized disk, open and ready to be passed to QEMU.
#[derive(Debug)]
pub struct PreparedDisk {
    pub path: PathBuf,
    pub serial: Option<String>,
    pub device_opts: Vec<String>,
    file: File,
}

impl PreparedDisk {
    /// Open an existing image for handing to QEMU.
    pub(crate) fn open(spec: &DiskSpec, path: &Path) -> Result<Self, DiskError> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            serial: spec.serial.clone(),
            device_opts: spec.device_opts.clone(),
            file,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Descriptor number of the `index`th disk inside the child.
pub fn child_fd(index: usize) -> RawFd {
    FIRST_DISK_FD.saturating_add(RawFd::try_from(index).unwrap_or(RawFd::MAX))
}

/// Path the child opens for the `index`th disk.
pub fn child_fd_path(index: usize) -> String {
    format!("/proc/self/fd/{}", child_fd(index))
}

/// Make `disks` appear in the child spawned by `cmd` as descriptors
/// `child_fd(0)`, `child_fd(1)`, ... and in no other process.
pub fn pass_to_child(cmd: &mut Command, disks: &[PreparedDisk]) {
    let mut mapping: Vec<(RawFd, RawFd)> = disks
        .iter()
        .enumerate()
        .map(|(i, disk)| (disk.fd(), child_fd(i)))
        .collect();
    let floor = child_fd(mapping.len());
    // SAFETY: the closure runs between fork and exec and only issues
    // fcntl/dup2 on a vector allocated before the fork.
    unsafe {
        cmd.pre_exec(move || remap_fds(&mut mapping, floor));
    }
}

/// Move every source above `floor` first, so no target can clobber a source
/// that still has to be copied, then place each one on its target.
fn remap_fds(mapping: &mut [(RawFd, RawFd)], floor: RawFd) -> io::Result<()> {
    for (src, _) in mapping.iter_mut() {
        // SAFETY: plain fcntl on a descriptor this process owns.
        let moved = unsafe { libc::fcntl(*src, libc::F_DUPFD_CLOEXEC, floor) };
        if moved < 0 {
            return Err(io::Error::last_os_error());
        }
        *src = moved;
    }
    for &(src, target) in mapping.iter() {
        // SAFETY: as above; dup2 leaves `target` without FD_CLOEXEC.
        if unsafe { libc::dup2(src, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
}

/// Check every spec before any file is created.
pub fn validate_disks(specs: &[DiskSpec]) -> fleet::Result<()> {
    for spec in specs {
        spec.validate()?;
    }
    Ok(())
}

/// Create the image for `spec` at `path` and open it for QEMU.
///
/// QEMU reaches the image through its descriptor rather than a path, so
/// backing-file references resolve regardless of its working directory.
pub async fn prepare_disk(spec: &DiskSpec, path: &Path) -> fleet::Result<PreparedDisk> {
    let source = spec.validate()?;
    let target = path.to_string_lossy().into_owned();

    match source {
        DiskSource::Sized(size) => {
            exec("qemu-img", &["create", "-f", "qcow2", &target, &size.to_string()])
                .await
                .map_err(DiskError::from)?;
        }
        DiskSource::Backed { file, extra_size } => {
            let backing = tokio::fs::canonicalize(file)
                .await
                .map_err(|e| DiskError::Backing {
                    path: file.to_path_buf(),
                    detail: e.to_string(),
                })?;
            let backing = backing.to_string_lossy().into_owned();
            let format = backing_format(&backing).await?;
            exec(
                "qemu-img",
                &["create", "-f", "qcow2", "-F", &format, "-b", &backing, &target],
            )
            .await
            .map_err(DiskError::from)?;
            if let Some(extra) = extra_size {
                exec("qemu-img", &["resize", &target, &format!("+{extra}")])
                    .await
                    .map_err(DiskError::from)?;
            }
        }
    }

    let disk = PreparedDisk::open(spec, path)?;
    debug!(path = %target, fd = disk.fd(), "disk prepared");
    Ok(disk)
}

async fn backing_format(path: &str) -> Result<String, DiskError> {
    let json = exec("qemu-img", &["info", "--output=json", path]).await?;
    parse_format(&json).map_err(|detail| DiskError::Backing {
        path: PathBuf::from(path),
        detail,
    })
}

fn parse_format(json: &str) -> Result<String, String> {
    serde_json::from_str::<ImageInfo>(json)
        .map(|info| info.format)
        .map_err(|e| format!("parse qemu-img info: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_image_format() {
        let json = r#"{"virtual-size": 8589934592, "filename": "flatcar.img", "format": "qcow2", "dirty-flag": false}"#;
        assert_eq!(parse_format(json).unwrap(), "qcow2");
        assert!(parse_format("{}").is_err());
    }

    #[test]
    fn conflicting_specs_fail_validation_up_front() {
        let specs = [
            DiskSpec::sized(1 << 30),
            DiskSpec {
                size: Some(1 << 30),
                backing_file: Some("base.img".into()),
                ..DiskSpec::default()
            },
        ];
        assert!(matches!(validate_disks(&specs), Err(FleetError::DiskSpec(_))));
    }

    #[tokio::test]
    async fn invalid_spec_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk1.qcow2");
        let spec = DiskSpec::sized(1 << 30).with_extra_size(1 << 20);
        let err = prepare_disk(&spec, &path).await.unwrap_err();
        assert!(matches!(err, FleetError::DiskSpec(_)), "unexpected error: {err}");
        assert!(!path.exists());
    }

    fn open_image(dir: &Path, name: &str) -> PreparedDisk {
        let path = dir.join(name);
        std::fs::write(&path, b"qcow").unwrap();
        PreparedDisk::open(&DiskSpec::sized(1 << 30), &path).unwrap()
    }

    #[tokio::test]
    async fn unrelated_children_do_not_inherit_images() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open_image(dir.path(), "disk1.qcow2");
        let out = Command::new("ls")
            .args(["-l", "/proc/self/fd/"])
            .output()
            .await
            .unwrap();
        let listing = String::from_utf8_lossy(&out.stdout);
        assert!(!listing.contains("disk1.qcow2"), "leaked: {listing}");
        drop(disk);
    }

    #[tokio::test]
    async fn disks_land_on_fixed_descriptors_in_child() {
        let dir = tempfile::tempdir().unwrap();
        let disks = [
            open_image(dir.path(), "disk0.qcow2"),
            open_image(dir.path(), "disk1.qcow2"),
        ];
        let mut cmd = Command::new("readlink");
        cmd.args([child_fd_path(0), child_fd_path(1)]);
        pass_to_child(&mut cmd, &disks);
        let out = cmd.output().await.unwrap();
        assert!(out.status.success());
        let links: Vec<String> = String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(
            links,
            [
                disks[0].path.to_string_lossy(),
                disks[1].path.to_string_lossy()
            ]
        );
    }

    #[test]
    fn child_descriptors_are_consecutive() {
        assert_eq!(child_fd(0), FIRST_DISK_FD);
        assert_eq!(child_fd_path(2), "/proc/self/fd/5");
    }

    #[tokio::test]
    async fn missing_backing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spec = DiskSpec::backed(dir.path().join("nope.img"));
        let err = prepare_disk(&spec, &dir.path().join("disk1.qcow2"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope.img"), "error was: {err}");
    }
}
