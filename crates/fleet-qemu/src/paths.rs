use std::path::{Path, PathBuf};

/// Flight-level working directory.
pub struct FlightPaths {
    dir: PathBuf,
}

impl FlightPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Private half of the fleet key; `.pub` next to it.
    pub fn ssh_key(&self) -> PathBuf {
        self.dir.join("id_ed25519")
    }

    pub fn ssh_public_key(&self) -> PathBuf {
        self.dir.join("id_ed25519.pub")
    }
}

/// Per-machine working directory. The only artifact left after destroy.
pub struct MachinePaths {
    dir: PathBuf,
}

impl MachinePaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ignition(&self) -> PathBuf {
        self.dir.join("ignition.json")
    }

    /// Root of the config-drive tree shared over 9p.
    pub fn config_drive(&self) -> PathBuf {
        self.dir.join("config-2")
    }

    pub fn config_drive_user_data(&self) -> PathBuf {
        self.config_drive()
            .join("openstack")
            .join("latest")
            .join("user_data")
    }

    pub fn console(&self) -> PathBuf {
        self.dir.join("console.txt")
    }

    pub fn journal(&self) -> PathBuf {
        self.dir.join("journal.txt")
    }

    /// Disk `index`; 0 is the primary overlay.
    pub fn disk(&self, index: usize) -> PathBuf {
        self.dir.join(format!("disk{index}.qcow2"))
    }

    pub fn firmware_vars(&self) -> PathBuf {
        self.dir.join("vars.fd")
    }

    pub fn tpm_state(&self) -> PathBuf {
        self.dir.join("tpm")
    }

    pub fn tpm_socket(&self) -> PathBuf {
        self.dir.join("swtpm.sock")
    }

    pub fn vnc_socket(&self) -> PathBuf {
        self.dir.join("vnc.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_layout() {
        let p = MachinePaths::new(PathBuf::from("/out/m1"));
        assert_eq!(p.console(), PathBuf::from("/out/m1/console.txt"));
        assert_eq!(p.disk(1), PathBuf::from("/out/m1/disk1.qcow2"));
        assert_eq!(
            p.config_drive_user_data(),
            PathBuf::from("/out/m1/config-2/openstack/latest/user_data")
        );
    }
}
