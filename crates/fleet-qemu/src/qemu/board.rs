use fleet::{FleetError, Result};

/// How QEMU must be invoked for one (host, board) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardProfile {
    pub binary: &'static str,
    pub machine: &'static str,
    pub accel: &'static str,
    pub cpu: &'static str,
    pub tpm_device: &'static str,
}

/// Pick the machine/accelerator/CPU triple for `board` on a `host_arch` host.
///
/// Native combinations use KVM with host CPU passthrough; cross combinations
/// fall back to TCG with a concrete CPU model.
pub fn board_profile(host_arch: &str, board: &str) -> Result<BoardProfile> {
    let profile = match (host_arch, board) {
        ("x86_64", "amd64-usr") => BoardProfile {
            binary: "qemu-system-x86_64",
            machine: "q35",
            accel: "kvm",
            cpu: "host",
            tpm_device: "tpm-tis",
        },
        (_, "amd64-usr") => BoardProfile {
            binary: "qemu-system-x86_64",
            machine: "q35",
            accel: "tcg",
            cpu: "Haswell",
            tpm_device: "tpm-tis",
        },
        ("aarch64", "arm64-usr") => BoardProfile {
            binary: "qemu-system-aarch64",
            machine: "virt,gic-version=host",
            accel: "kvm",
            cpu: "host",
            tpm_device: "tpm-tis-device",
        },
        (_, "arm64-usr") => BoardProfile {
            binary: "qemu-system-aarch64",
            machine: "virt",
            accel: "tcg",
            cpu: "cortex-a57",
            tpm_device: "tpm-tis-device",
        },
        _ => return Err(FleetError::UnknownBoard(board.to_string())),
    };
    Ok(profile)
}

/// Profile for the architecture this process runs on.
pub fn host_board_profile(board: &str) -> Result<BoardProfile> {
    board_profile(std::env::consts::ARCH, board)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_boards_use_kvm() {
        let p = board_profile("x86_64", "amd64-usr").unwrap();
        assert_eq!((p.machine, p.accel, p.cpu), ("q35", "kvm", "host"));
        let p = board_profile("aarch64", "arm64-usr").unwrap();
        assert_eq!(p.binary, "qemu-system-aarch64");
        assert_eq!(p.accel, "kvm");
    }

    #[test]
    fn cross_boards_use_tcg() {
        let p = board_profile("aarch64", "amd64-usr").unwrap();
        assert_eq!((p.accel, p.cpu), ("tcg", "Haswell"));
        let p = board_profile("x86_64", "arm64-usr").unwrap();
        assert_eq!((p.machine, p.accel, p.cpu), ("virt", "tcg", "cortex-a57"));
    }

    #[test]
    fn unknown_board_is_rejected() {
        assert!(matches!(
            board_profile("x86_64", "riscv-usr"),
            Err(FleetError::UnknownBoard(b)) if b == "riscv-usr"
        ));
    }
}
