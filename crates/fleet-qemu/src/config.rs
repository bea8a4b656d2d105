use std::path::{Path, PathBuf};

use fleet::{FleetError, Result};
use serde::{Deserialize, Serialize};

use crate::network::Segment;

const DEFAULT_BASE_DIR: &str = "/var/tmp/fleet";
const DEFAULT_BOARD: &str = "amd64-usr";
const DEFAULT_MEMORY_MIB: u32 = 1024;
const DEFAULT_CPUS: u32 = 1;
/// Every usable address of a /24 except the bridge.
const DEFAULT_LEASES: usize = 253;

/// Settings shared by every cluster and machine of one flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuFlightConfig {
    /// Namespace and directory name; generated when absent.
    pub name: Option<String>,
    /// Parent of the flight's working directory.
    pub base_dir: PathBuf,
    /// Overrides the board's default `qemu-system-*` binary.
    pub qemu_binary: Option<PathBuf>,
    /// Guest board, e.g. `amd64-usr` or `arm64-usr`.
    pub board: String,
    /// Base disk image; every machine boots from a copy-on-write overlay of it.
    pub image: PathBuf,
    /// Firmware image (`-bios`), or the pflash code image with `firmware_vars`.
    pub firmware: Option<PathBuf>,
    /// Variable store template, copied fresh for each machine.
    pub firmware_vars: Option<PathBuf>,
    pub memory_mib: u32,
    pub cpus: u32,
    /// Directory served to guests over HTTP.
    pub file_root: Option<PathBuf>,
    pub segments: u8,
    pub leases_per_segment: usize,
}

impl Default for QemuFlightConfig {
    fn default() -> Self {
        Self {
            name: None,
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            qemu_binary: None,
            board: DEFAULT_BOARD.to_string(),
            image: PathBuf::new(),
            firmware: None,
            firmware_vars: None,
            memory_mib: DEFAULT_MEMORY_MIB,
            cpus: DEFAULT_CPUS,
            file_root: None,
            segments: 1,
            leases_per_segment: DEFAULT_LEASES,
        }
    }
}

impl QemuFlightConfig {
    /// Reject settings that would only fail once resources exist.
    pub fn validate(&self) -> Result<()> {
        if self.image.as_os_str().is_empty() {
            return Err(FleetError::InvalidConfig("image is required".into()));
        }
        if self.segments == 0 {
            return Err(FleetError::InvalidConfig("at least one segment is required".into()));
        }
        let capacity = Segment::new(0, usize::MAX).leases().len();
        if self.leases_per_segment == 0 || self.leases_per_segment > capacity {
            return Err(FleetError::InvalidConfig(format!(
                "leases_per_segment must be within 1-{capacity}"
            )));
        }
        if self.firmware_vars.is_some() && self.firmware.is_none() {
            return Err(FleetError::InvalidConfig(
                "firmware_vars requires firmware".into(),
            ));
        }
        if self.memory_mib == 0 || self.cpus == 0 {
            return Err(FleetError::InvalidConfig(
                "memory_mib and cpus must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths against `dir`.
    pub fn resolve_paths(&mut self, dir: &Path) {
        for path in [
            Some(&mut self.base_dir),
            Some(&mut self.image),
            self.qemu_binary.as_mut(),
            self.firmware.as_mut(),
            self.firmware_vars.as_mut(),
            self.file_root.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = dir.join(&*path);
            }
        }
    }

    /// Load from YAML, resolving relative paths against the file's directory.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FleetError::InvalidConfig(format!("read {}: {e}", path.display())))?;
        let mut config: Self = serde_yaml_ng::from_str(&content)
            .map_err(|e| FleetError::InvalidConfig(format!("parse {}: {e}", path.display())))?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> QemuFlightConfig {
        QemuFlightConfig {
            image: PathBuf::from("/images/flatcar.img"),
            ..QemuFlightConfig::default()
        }
    }

    #[test]
    fn defaults_validate_once_image_is_set() {
        assert!(QemuFlightConfig::default().validate().is_err());
        valid().validate().unwrap();
    }

    #[test]
    fn rejects_bad_sizes() {
        let mut c = valid();
        c.segments = 0;
        assert!(matches!(c.validate(), Err(FleetError::InvalidConfig(_))));

        let mut c = valid();
        c.leases_per_segment = 254;
        assert!(matches!(c.validate(), Err(FleetError::InvalidConfig(_))));

        let mut c = valid();
        c.firmware_vars = Some("vars.fd".into());
        assert!(matches!(c.validate(), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let mut c = valid();
        c.image = PathBuf::from("images/flatcar.img");
        c.firmware = Some(PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd"));
        c.resolve_paths(Path::new("/srv/tests"));
        assert_eq!(c.image, PathBuf::from("/srv/tests/images/flatcar.img"));
        assert_eq!(c.firmware, Some(PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd")));
        assert_eq!(c.base_dir, PathBuf::from(DEFAULT_BASE_DIR));
    }

    #[tokio::test]
    async fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.yaml");
        std::fs::write(&path, "board: arm64-usr\nimage: flatcar.img\nmemory_mib: 2048\n").unwrap();
        let c = QemuFlightConfig::load(&path).await.unwrap();
        assert_eq!(c.board, "arm64-usr");
        assert_eq!(c.memory_mib, 2048);
        assert_eq!(c.cpus, DEFAULT_CPUS);
        assert_eq!(c.image, dir.path().join("flatcar.img"));
    }
}
