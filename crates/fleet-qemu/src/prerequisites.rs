use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use fleet::FleetError;
use tracing::warn;

use crate::config::QemuFlightConfig;
use crate::qemu::BoardProfile;

/// Verify the host can run a flight before anything is created.
///
/// Checks root privileges, the base image and firmware, and every command the
/// backend shells out to except swtpm (see [`check_swtpm`]). Collects all
/// failures and returns them in a single `BackendNotAvailable` error. A
/// missing `/dev/kvm` only warns.
pub fn check_prerequisites(
    config: &QemuFlightConfig,
    profile: &BoardProfile,
) -> Result<(), FleetError> {
    let mut errors = Vec::new();

    check_root(&mut errors);
    check_file_exists(&config.image, "base image", &mut errors);
    if let Some(firmware) = &config.firmware {
        check_file_exists(firmware, "firmware", &mut errors);
    }
    if let Some(vars) = &config.firmware_vars {
        check_file_exists(vars, "firmware variable template", &mut errors);
    }
    if let Some(root) = &config.file_root {
        check_file_exists(root, "file server root", &mut errors);
    }
    match &config.qemu_binary {
        Some(binary) => {
            check_file_exists(binary, "qemu binary", &mut errors);
            check_executable(binary, "qemu binary", &mut errors);
        }
        None => check_command(profile.binary, &mut errors),
    }
    check_kvm(profile);
    check_required_commands(&mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(FleetError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_root(errors: &mut Vec<String>) {
    if !nix::unistd::geteuid().is_root() {
        errors.push(
            "root required for namespace and network configuration; please run with sudo"
                .to_string(),
        );
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(profile: &BoardProfile) {
    if profile.accel != "kvm" {
        return;
    }
    let kvm = Path::new("/dev/kvm");
    if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        warn!(error = %e, "/dev/kvm not accessible, guests will be slow or fail to start");
    }
}

fn check_command(cmd: &str, errors: &mut Vec<String>) {
    if which::which(cmd).is_err() {
        errors.push(format!("required command not found: {cmd}"));
    }
}

const REQUIRED_COMMANDS: &[&str] = &[
    "ip",
    "iptables",
    "iptables-save",
    "sysctl",
    "dnsmasq",
    "qemu-img",
    "ssh",
    "ssh-keygen",
];

fn check_required_commands(errors: &mut Vec<String>) {
    for cmd in REQUIRED_COMMANDS {
        check_command(cmd, errors);
    }
}

/// Only machines that ask for a TPM need swtpm.
pub fn check_swtpm() -> Result<(), FleetError> {
    let mut errors = Vec::new();
    check_command("swtpm", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FleetError::BackendNotAvailable(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_command_is_reported_by_name() {
        let mut errors = Vec::new();
        check_command("fleet-no-such-command", &mut errors);
        assert_eq!(errors, ["required command not found: fleet-no-such-command"]);
    }

    #[test]
    fn missing_files_are_all_reported() {
        let mut errors = Vec::new();
        check_file_exists(Path::new("/nonexistent/a.img"), "base image", &mut errors);
        check_file_exists(Path::new("/nonexistent/b.fd"), "firmware", &mut errors);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("base image"));
        assert!(errors[1].contains("/nonexistent/b.fd"));
    }

    #[test]
    fn non_executable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu");
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let mut errors = Vec::new();
        check_executable(&path, "qemu binary", &mut errors);
        assert_eq!(errors.len(), 1);
    }
}
