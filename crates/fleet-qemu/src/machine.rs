use std::ffi::OsStr;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fleet::{
    DiskSpec, FleetError, Machine, MachineOptions, MachineState, PayloadTransport,
    RenderedUserData, RuntimeConfig, SshCredentials, SshOutput, UserData, check_machine,
    reboot_machine,
};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterInner;
use crate::dialer::NsDialer;
use crate::flight::FlightInner;
use crate::journal::JournalCapture;
use crate::netns::NetNs;
use crate::network::{Interface, VirtualLan};
use crate::paths::MachinePaths;
use crate::prerequisites::check_swtpm;
use crate::process::{forward_output, terminate};
use crate::qemu::{QemuBuilder, Swtpm, pass_to_child, prepare_disk};
use crate::ssh::SshClient;

const SSH_PORT: u16 = 22;

/// OS resources held while the machine lives; each is released once.
#[derive(Default)]
struct Resources {
    qemu: Option<Child>,
    swtpm: Option<Swtpm>,
    journal: Option<JournalCapture>,
    tap: bool,
}

/// One QEMU process on a flight's LAN.
pub struct QemuMachine {
    id: String,
    segment: String,
    interface: Interface,
    tap: String,
    paths: MachinePaths,
    config: RuntimeConfig,
    cluster: Weak<ClusterInner>,
    ns: Arc<NetNs>,
    lan: Arc<VirtualLan>,
    ssh: Arc<SshClient>,
    state: AtomicU8,
    resources: tokio::sync::Mutex<Resources>,
}

impl QemuMachine {
    /// Start a machine and return once it passed the health check.
    ///
    /// A machine that fails to boot is destroyed before the error is
    /// returned; its directory keeps the console and journal captured so far.
    pub(crate) async fn boot(
        cluster: &Arc<ClusterInner>,
        segment: String,
        interface: Interface,
        userdata: UserData,
        options: MachineOptions,
    ) -> fleet::Result<Arc<Self>> {
        let id = uuid::Uuid::new_v4().to_string();
        let machine = Arc::new(Self {
            paths: MachinePaths::new(cluster.config.output_dir.join(&id)),
            tap: format!("tap-{}-{}", interface.segment, interface.index),
            id,
            segment,
            interface,
            config: cluster.config.clone(),
            cluster: Arc::downgrade(cluster),
            ns: Arc::clone(&cluster.flight.ns),
            lan: Arc::clone(&cluster.flight.lan),
            ssh: Arc::clone(&cluster.ssh),
            state: AtomicU8::new(MachineState::Created as u8),
            resources: tokio::sync::Mutex::new(Resources::default()),
        });
        info!(id = %machine.id, ip = %machine.ip(), "booting machine");

        if let Err(e) = machine.start(&cluster.flight, &userdata, &options).await {
            machine
                .state
                .store(MachineState::Failed as u8, Ordering::Release);
            warn!(id = %machine.id, error = %e, "machine failed to boot");
            machine.destroy().await;
            return Err(e);
        }
        Ok(machine)
    }

    /// Atomically move from `from` to `to`; `false` if the state was not `from`.
    fn transition(&self, from: MachineState, to: MachineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn paths(&self) -> &MachinePaths {
        &self.paths
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    async fn start(
        &self,
        flight: &FlightInner,
        userdata: &UserData,
        options: &MachineOptions,
    ) -> fleet::Result<()> {
        tokio::fs::create_dir_all(self.paths.dir()).await?;
        let rendered = userdata.render()?;
        let payload = self.write_payload(&rendered).await?;

        let mut disks = Vec::with_capacity(options.extra_disks.len() + 1);
        let primary = DiskSpec::backed(flight.config.image.clone());
        disks.push(prepare_disk(&primary, &self.paths.disk(0)).await?);
        for (i, spec) in options.extra_disks.iter().enumerate() {
            disks.push(prepare_disk(spec, &self.paths.disk(i + 1)).await?);
        }

        let mut builder = QemuBuilder::new(
            flight.profile,
            options.memory_mib.unwrap_or(flight.config.memory_mib),
            options.cpus.unwrap_or(flight.config.cpus),
        );
        let firmware = options.firmware.as_ref().or(flight.config.firmware.as_ref());
        match (firmware, &flight.config.firmware_vars) {
            (Some(code), Some(template)) => {
                let vars = self.paths.firmware_vars();
                tokio::fs::copy(template, &vars).await?;
                builder.pflash(code, &vars);
            }
            (Some(bios), None) => {
                builder.bios(bios);
            }
            (None, _) => {}
        }
        builder
            .console(&self.paths.console())
            .nic(&self.tap, self.interface.mac)
            .payload(rendered.transport, &payload);
        for disk in &disks {
            builder.disk(disk);
        }

        if options.enable_tpm {
            check_swtpm()?;
            let tpm = Swtpm::start(&self.id, &self.paths.tpm_state(), &self.paths.tpm_socket())
                .await?;
            builder.tpm(tpm.socket());
            self.resources.lock().await.swtpm = Some(tpm);
        }
        if options.enable_vnc {
            builder.vnc(&self.paths.vnc_socket());
        }
        builder.extra_args(&options.extra_qemu_args);

        self.lan.add_tap(&self.segment, &self.tap).await?;
        self.resources.lock().await.tap = true;

        let program = match &flight.config.qemu_binary {
            Some(path) => path.as_os_str(),
            None => OsStr::new(builder.binary()),
        };
        let args = builder.build();
        debug!(id = %self.id, qemu = ?program, args = %args.join(" "), "starting qemu");
        let mut cmd = self.ns.command(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        pass_to_child(&mut cmd, &disks);
        let mut child = cmd
            .spawn()
            .map_err(|e| FleetError::command(program.to_string_lossy(), e.to_string()))?;
        // QEMU holds its own copies of the descriptors now.
        drop(disks);
        forward_output(&self.id, "qemu", &mut child);
        self.resources.lock().await.qemu = Some(child);
        self.transition(MachineState::Created, MachineState::Booting);

        self.wait_for_ssh().await?;
        self.start_journal().await;
        check_machine(self).await?;

        if !self.transition(MachineState::Booting, MachineState::Running) {
            return Err(FleetError::NotReady {
                id: self.id.clone(),
                detail: format!("machine left booting state ({})", self.state()),
            });
        }
        info!(id = %self.id, ip = %self.ip(), "machine running");
        Ok(())
    }

    /// Write the payload where its transport expects it and return the path
    /// handed to QEMU.
    async fn write_payload(&self, rendered: &RenderedUserData) -> fleet::Result<PathBuf> {
        match rendered.transport {
            PayloadTransport::FirmwareConfig => {
                let path = self.paths.ignition();
                tokio::fs::write(&path, &rendered.bytes).await?;
                Ok(path)
            }
            PayloadTransport::ConfigDrive => {
                let user_data = self.paths.config_drive_user_data();
                if let Some(parent) = user_data.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&user_data, &rendered.bytes).await?;
                Ok(self.paths.config_drive())
            }
        }
    }

    async fn wait_for_ssh(&self) -> fleet::Result<()> {
        let dialer = NsDialer::new(
            Arc::clone(&self.ns),
            self.config.ssh_retries,
            self.config.ssh_retry_delay(),
            self.config.ssh_timeout(),
        );
        let addr = SocketAddr::new(self.ip(), SSH_PORT);
        match dialer.dial(addr).await {
            Ok(_stream) => Ok(()),
            Err(e) => {
                let detail = match self.qemu_exit_status().await {
                    Some(status) => format!("qemu exited ({status}) before {addr} opened"),
                    None => e.to_string(),
                };
                Err(FleetError::NotReady {
                    id: self.id.clone(),
                    detail,
                })
            }
        }
    }

    async fn qemu_exit_status(&self) -> Option<std::process::ExitStatus> {
        let mut resources = self.resources.lock().await;
        resources.qemu.as_mut()?.try_wait().ok().flatten()
    }

    async fn start_journal(&self) {
        let journal = JournalCapture::start(
            CancellationToken::new(),
            Arc::clone(&self.ssh),
            self.id.clone(),
            self.ip(),
            self.paths.journal(),
        );
        self.resources.lock().await.journal = Some(journal);
    }

    fn read_capture(path: PathBuf) -> String {
        std::fs::read(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Machine for QemuMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> IpAddr {
        IpAddr::V4(self.interface.ipv4.addr())
    }

    /// Machines only live on the flight LAN, so both addresses coincide.
    fn private_ip(&self) -> IpAddr {
        self.ip()
    }

    fn runtime_config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn state(&self) -> MachineState {
        MachineState::from_u8(self.state.load(Ordering::Acquire))
    }

    async fn ssh(&self, cmd: &str) -> fleet::Result<SshOutput> {
        self.ssh.run(self.ip(), &SshCredentials::FleetKey, cmd).await
    }

    async fn ssh_with(&self, credentials: &SshCredentials, cmd: &str) -> fleet::Result<SshOutput> {
        self.ssh.run(self.ip(), credentials, cmd).await
    }

    async fn reboot(&self) -> fleet::Result<()> {
        if !self.transition(MachineState::Running, MachineState::Rebooting) {
            return Err(FleetError::NotReady {
                id: self.id.clone(),
                detail: format!("cannot reboot in state {}", self.state()),
            });
        }
        match reboot_machine(self).await {
            Ok(()) => {
                self.transition(MachineState::Rebooting, MachineState::Running);
                info!(id = %self.id, "machine rebooted");
                Ok(())
            }
            Err(e) => {
                self.transition(MachineState::Rebooting, MachineState::Failed);
                warn!(id = %self.id, error = %e, "machine failed to come back from reboot");
                Err(e)
            }
        }
    }

    async fn destroy(&self) {
        let prev = MachineState::from_u8(
            self.state
                .swap(MachineState::Destroyed as u8, Ordering::AcqRel),
        );
        if prev == MachineState::Destroyed {
            return;
        }

        let mut resources = self.resources.lock().await;
        if let Some(journal) = resources.journal.take() {
            journal.stop().await;
        }
        if let Some(mut qemu) = resources.qemu.take() {
            terminate(&self.id, "qemu", &mut qemu).await;
        }
        if let Some(mut tpm) = resources.swtpm.take() {
            tpm.stop().await;
        }
        if std::mem::take(&mut resources.tap) {
            self.lan.remove_tap(&self.tap).await;
        }
        drop(resources);

        if let Err(e) = tokio::fs::remove_file(self.paths.firmware_vars()).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!(id = %self.id, error = %e, "failed to remove firmware variables");
        }

        let console = self.console_output();
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.del_mach(&self.id, console);
        }
        info!(id = %self.id, from = %prev, "machine destroyed");
    }

    fn console_output(&self) -> String {
        Self::read_capture(self.paths.console())
    }

    fn journal_output(&self) -> String {
        Self::read_capture(self.paths.journal())
    }
}
