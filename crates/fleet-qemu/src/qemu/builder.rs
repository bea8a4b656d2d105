//! QEMU command line for one machine.
//!
//! The builder only produces arguments; spawning and supervising the process
//! belongs to the machine. Argument order is fixed so a machine's command
//! line can be diffed against a previous run's.

use std::path::{Path, PathBuf};

use fleet::PayloadTransport;

use super::board::BoardProfile;
use super::disk::{PreparedDisk, child_fd_path};
use crate::network::MacAddr;

/// fw_cfg key Ignition looks for on QEMU.
const IGNITION_FW_CFG: &str = "opt/org.flatcar-linux/config";
/// 9p tag the guest mounts as a config drive.
const CONFIG_DRIVE_TAG: &str = "config-2";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Firmware {
    Bios(PathBuf),
    /// Read-only code plus a per-machine writable variable store.
    Pflash { code: PathBuf, vars: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Nic {
    tap: String,
    mac: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Drive {
    file: String,
    serial: Option<String>,
    device_opts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QemuBuilder {
    profile: BoardProfile,
    memory_mib: u32,
    cpus: u32,
    firmware: Option<Firmware>,
    console: Option<PathBuf>,
    nics: Vec<Nic>,
    drives: Vec<Drive>,
    payload: Option<(PayloadTransport, PathBuf)>,
    tpm_socket: Option<PathBuf>,
    vnc_socket: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl QemuBuilder {
    pub fn new(profile: BoardProfile, memory_mib: u32, cpus: u32) -> Self {
        Self {
            profile,
            memory_mib,
            cpus,
            firmware: None,
            console: None,
            nics: Vec::new(),
            drives: Vec::new(),
            payload: None,
            tpm_socket: None,
            vnc_socket: None,
            extra_args: Vec::new(),
        }
    }

    pub fn binary(&self) -> &'static str {
        self.profile.binary
    }

    pub fn bios(&mut self, path: &Path) -> &mut Self {
        self.firmware = Some(Firmware::Bios(path.to_path_buf()));
        self
    }

    /// UEFI code image with `vars`, which must be a private copy.
    pub fn pflash(&mut self, code: &Path, vars: &Path) -> &mut Self {
        self.firmware = Some(Firmware::Pflash {
            code: code.to_path_buf(),
            vars: vars.to_path_buf(),
        });
        self
    }

    /// Redirect the first serial port into `path`.
    pub fn console(&mut self, path: &Path) -> &mut Self {
        self.console = Some(path.to_path_buf());
        self
    }

    pub fn nic(&mut self, tap: &str, mac: MacAddr) -> &mut Self {
        self.nics.push(Nic {
            tap: tap.to_string(),
            mac,
        });
        self
    }

    /// Attach `disk` by the descriptor it gets in the child. Order of calls
    /// is the order the guest enumerates the devices in, and must match the
    /// order the disks are passed to the child.
    pub fn disk(&mut self, disk: &PreparedDisk) -> &mut Self {
        self.drives.push(Drive {
            file: child_fd_path(self.drives.len()),
            serial: disk.serial.clone(),
            device_opts: disk.device_opts.clone(),
        });
        self
    }

    /// Expose the payload at `path` the way `transport` expects: the file
    /// itself over fw_cfg, or its directory tree over 9p.
    pub fn payload(&mut self, transport: PayloadTransport, path: &Path) -> &mut Self {
        self.payload = Some((transport, path.to_path_buf()));
        self
    }

    pub fn tpm(&mut self, socket: &Path) -> &mut Self {
        self.tpm_socket = Some(socket.to_path_buf());
        self
    }

    pub fn vnc(&mut self, socket: &Path) -> &mut Self {
        self.vnc_socket = Some(socket.to_path_buf());
        self
    }

    /// Appended verbatim after everything else.
    pub fn extra_args(&mut self, args: &[String]) -> &mut Self {
        self.extra_args.extend_from_slice(args);
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |parts: &[&str]| args.extend(parts.iter().map(|s| s.to_string()));

        let p = &self.profile;
        push(&["-machine", &format!("{},accel={}", p.machine, p.accel)]);
        push(&["-cpu", p.cpu]);
        push(&["-m", &self.memory_mib.to_string()]);
        push(&["-smp", &self.cpus.to_string()]);
        push(&["-nodefaults", "-no-user-config"]);

        match &self.firmware {
            Some(Firmware::Bios(path)) => push(&["-bios", &path.to_string_lossy()]),
            Some(Firmware::Pflash { code, vars }) => {
                push(&[
                    "-drive",
                    &format!(
                        "if=pflash,unit=0,format=raw,readonly=on,file={}",
                        code.display()
                    ),
                ]);
                push(&[
                    "-drive",
                    &format!("if=pflash,unit=1,format=raw,file={}", vars.display()),
                ]);
            }
            None => {}
        }

        match &self.console {
            Some(path) => {
                push(&[
                    "-chardev",
                    &format!("file,id=console,path={}", path.display()),
                ]);
                push(&["-serial", "chardev:console"]);
            }
            None => push(&["-serial", "none"]),
        }

        push(&[
            "-object",
            "rng-random,id=rng0,filename=/dev/urandom",
            "-device",
            "virtio-rng-pci,rng=rng0",
        ]);

        for (i, nic) in self.nics.iter().enumerate() {
            push(&[
                "-netdev",
                &format!("tap,id=net{i},ifname={},script=no,downscript=no", nic.tap),
            ]);
            push(&[
                "-device",
                &format!("virtio-net-pci,netdev=net{i},mac={}", nic.mac),
            ]);
        }

        for (i, drive) in self.drives.iter().enumerate() {
            push(&[
                "-drive",
                &format!("if=none,id=disk{i},format=qcow2,file={}", drive.file),
            ]);
            let mut device = format!("virtio-blk-pci,drive=disk{i}");
            if let Some(serial) = &drive.serial {
                device.push_str(&format!(",serial={serial}"));
            }
            for opt in &drive.device_opts {
                device.push(',');
                device.push_str(opt);
            }
            push(&["-device", &device]);
        }

        match &self.payload {
            Some((PayloadTransport::FirmwareConfig, path)) => push(&[
                "-fw_cfg",
                &format!("name={IGNITION_FW_CFG},file={}", path.display()),
            ]),
            Some((PayloadTransport::ConfigDrive, path)) => {
                push(&[
                    "-fsdev",
                    &format!(
                        "local,id=cfg,security_model=none,readonly=on,path={}",
                        path.display()
                    ),
                ]);
                push(&[
                    "-device",
                    &format!("virtio-9p-pci,fsdev=cfg,mount_tag={CONFIG_DRIVE_TAG}"),
                ]);
            }
            None => {}
        }

        if let Some(socket) = &self.tpm_socket {
            push(&[
                "-chardev",
                &format!("socket,id=chrtpm,path={}", socket.display()),
            ]);
            push(&["-tpmdev", "emulator,id=tpm0,chardev=chrtpm"]);
            push(&["-device", &format!("{},tpmdev=tpm0", p.tpm_device)]);
        }

        match &self.vnc_socket {
            Some(socket) => push(&["-vnc", &format!("unix:{}", socket.display())]),
            None => push(&["-display", "none"]),
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::board_profile;

    fn builder() -> QemuBuilder {
        QemuBuilder::new(board_profile("x86_64", "amd64-usr").unwrap(), 2048, 2)
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter()
            .position(|a| a == needle)
            .unwrap_or_else(|| panic!("{needle:?} missing from {args:?}"))
    }

    #[test]
    fn minimal_machine() {
        let args = builder().build();
        assert_eq!(
            args[..8],
            ["-machine", "q35,accel=kvm", "-cpu", "host", "-m", "2048", "-smp", "2"]
        );
        assert!(args.contains(&"virtio-rng-pci,rng=rng0".to_string()));
        let display = position(&args, "-display");
        assert_eq!(args[display + 1], "none");
        assert!(!args.iter().any(|a| a == "-tpmdev" || a == "-fw_cfg"));
    }

    #[test]
    fn pflash_keeps_code_readonly_and_vars_writable() {
        let args = builder()
            .pflash(Path::new("/fw/code.fd"), Path::new("/out/m1/vars.fd"))
            .build();
        assert!(args.contains(
            &"if=pflash,unit=0,format=raw,readonly=on,file=/fw/code.fd".to_string()
        ));
        assert!(args.contains(&"if=pflash,unit=1,format=raw,file=/out/m1/vars.fd".to_string()));
        assert!(!args.contains(&"-bios".to_string()));
    }

    #[test]
    fn network_device_carries_lease_mac() {
        let mac = MacAddr([0x02, 0, 0, 0, 0, 7]);
        let args = builder().nic("tap-m1", mac).build();
        assert!(args.contains(&"tap,id=net0,ifname=tap-m1,script=no,downscript=no".to_string()));
        assert!(args.contains(&"virtio-net-pci,netdev=net0,mac=02:00:00:00:00:07".to_string()));
    }

    #[test]
    fn ignition_goes_through_fw_cfg() {
        let args = builder()
            .payload(
                PayloadTransport::FirmwareConfig,
                Path::new("/out/m1/ignition.json"),
            )
            .build();
        let i = position(&args, "-fw_cfg");
        assert_eq!(
            args[i + 1],
            "name=opt/org.flatcar-linux/config,file=/out/m1/ignition.json"
        );
    }

    #[test]
    fn config_drive_goes_through_9p() {
        let args = builder()
            .payload(PayloadTransport::ConfigDrive, Path::new("/out/m1/config-2"))
            .build();
        assert!(args.contains(
            &"local,id=cfg,security_model=none,readonly=on,path=/out/m1/config-2".to_string()
        ));
        assert!(args.contains(&"virtio-9p-pci,fsdev=cfg,mount_tag=config-2".to_string()));
    }

    #[test]
    fn tpm_uses_board_device_and_vnc_replaces_headless_display() {
        let args = builder()
            .tpm(Path::new("/out/m1/swtpm.sock"))
            .vnc(Path::new("/out/m1/vnc.sock"))
            .build();
        assert!(args.contains(&"socket,id=chrtpm,path=/out/m1/swtpm.sock".to_string()));
        assert!(args.contains(&"tpm-tis,tpmdev=tpm0".to_string()));
        assert!(args.contains(&"unix:/out/m1/vnc.sock".to_string()));
        assert!(!args.contains(&"-display".to_string()));
    }

    #[test]
    fn drives_use_child_descriptors_in_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let open = |name: &str, spec: fleet::DiskSpec| {
            let path = dir.path().join(name);
            std::fs::write(&path, b"").unwrap();
            PreparedDisk::open(&spec, &path).unwrap()
        };
        let root = open("disk0.qcow2", fleet::DiskSpec::sized(1 << 30));
        let data = open(
            "disk1.qcow2",
            fleet::DiskSpec::sized(1 << 30).with_serial("secondary"),
        );
        let args = builder().disk(&root).disk(&data).build();
        assert!(args.contains(&"if=none,id=disk0,format=qcow2,file=/proc/self/fd/3".to_string()));
        assert!(args.contains(&"if=none,id=disk1,format=qcow2,file=/proc/self/fd/4".to_string()));
        assert!(args.contains(&"virtio-blk-pci,drive=disk1,serial=secondary".to_string()));
    }

    #[test]
    fn extra_args_come_last() {
        let args = builder()
            .console(Path::new("/out/m1/console.txt"))
            .extra_args(&["-s".to_string(), "-S".to_string()])
            .build();
        assert_eq!(args[args.len() - 2..], ["-s", "-S"]);
        let chardev = position(&args, "file,id=console,path=/out/m1/console.txt");
        assert!(chardev < args.len() - 2);
    }
}
