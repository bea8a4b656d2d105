use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fleet::{Cluster, Machine, MachineOptions, RuntimeConfig, UserData};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::flight::FlightInner;
use crate::machine::QemuMachine;
use crate::network::Interface;
use crate::qemu::validate_disks;
use crate::services::{OmahaResponder, ServiceHandle, UPDATE_PATH};
use crate::ssh::SshClient;

const UPDATE_CONF_PATH: &str = "/etc/flatcar/update.conf";
const SSHD_HARDENING_PATH: &str = "/etc/ssh/sshd_config.d/10-fleet-hardening.conf";
const SSHD_HARDENING: &str = "PermitRootLogin no\nPermitEmptyPasswords no\n";
const METADATA_UNIT: &str = "fleet-metadata.service";

pub(crate) struct ClusterInner {
    pub(crate) name: String,
    pub(crate) flight: Arc<FlightInner>,
    pub(crate) config: RuntimeConfig,
    pub(crate) ssh: Arc<SshClient>,
    omaha: ServiceHandle,
    omaha_responder: Arc<OmahaResponder>,
    machines: Mutex<HashMap<String, Arc<QemuMachine>>>,
    consoles: Mutex<HashMap<String, String>>,
}

impl ClusterInner {
    /// Forget machine `id`, keeping its final console output.
    pub(crate) fn del_mach(&self, id: &str, console: String) {
        self.machines.lock().remove(id);
        self.consoles.lock().insert(id.to_string(), console);
    }

    /// Cluster-wide defaults merged into every payload.
    fn merge_defaults(&self, userdata: &mut UserData, interface: &Interface) {
        if !self.config.no_ssh_key_in_userdata {
            userdata.add_ssh_keys(
                &self.config.default_user,
                std::slice::from_ref(&self.flight.ssh_public_key),
            );
        }
        userdata.add_file(
            UPDATE_CONF_PATH,
            &update_conf(self.flight.bridge_ip, self.omaha.addr().port()),
            0o644,
        );
        userdata.add_file(SSHD_HARDENING_PATH, SSHD_HARDENING, 0o600);
        let ip = interface.ipv4.addr();
        userdata.add_systemd_unit(METADATA_UNIT, &metadata_unit(ip.into(), ip.into()), true);
    }
}

/// Machines sharing one flight's LAN and one update-ping responder.
pub struct QemuCluster {
    inner: Arc<ClusterInner>,
}

impl QemuCluster {
    pub(crate) fn new(
        flight: Arc<FlightInner>,
        config: RuntimeConfig,
        omaha: ServiceHandle,
        omaha_responder: Arc<OmahaResponder>,
    ) -> Self {
        let ssh = Arc::new(SshClient::new(
            Arc::clone(&flight.ns),
            flight.paths.ssh_key(),
            config.default_user.clone(),
            config.ssh_timeout(),
        ));
        Self {
            inner: Arc::new(ClusterInner {
                name: flight.next_cluster_name(),
                flight,
                config,
                ssh,
                omaha,
                omaha_responder,
                machines: Mutex::new(HashMap::new()),
                consoles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Update checks answered so far for this cluster's machines.
    pub fn update_pings(&self) -> u64 {
        self.inner.omaha_responder.ping_count()
    }
}

#[async_trait]
impl Cluster for QemuCluster {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn runtime_config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    async fn new_machine_with_options(
        &self,
        userdata: Option<UserData>,
        options: MachineOptions,
    ) -> fleet::Result<Arc<dyn Machine>> {
        validate_disks(&options.extra_disks)?;

        let inner = &self.inner;
        let segment = inner
            .flight
            .lan
            .segments()
            .first()
            .map(|s| s.name().to_string())
            .unwrap_or_default();
        let interface = inner.flight.lan.get_interface(&segment);

        let mut userdata = userdata.unwrap_or_default();
        inner.merge_defaults(&mut userdata, &interface);

        let machine = QemuMachine::boot(inner, segment, interface, userdata, options).await?;
        inner
            .machines
            .lock()
            .insert(machine.id().to_string(), Arc::clone(&machine));
        Ok(machine)
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.inner
            .machines
            .lock()
            .values()
            .map(|m| Arc::clone(m) as Arc<dyn Machine>)
            .collect()
    }

    fn console_outputs(&self) -> HashMap<String, String> {
        self.inner.consoles.lock().clone()
    }

    async fn destroy(&self) {
        let machines: Vec<Arc<QemuMachine>> =
            self.inner.machines.lock().values().cloned().collect();
        for machine in machines {
            machine.destroy().await;
        }
        let leftover = self.inner.machines.lock().len();
        if leftover > 0 {
            warn!(cluster = %self.inner.name, leftover, "machines still tracked after destroy");
        }
        self.inner.omaha.stop().await;
        info!(cluster = %self.inner.name, "cluster destroyed");
    }
}

fn update_conf(bridge: IpAddr, port: u16) -> String {
    format!("GROUP=developer\nSERVER=http://{bridge}:{port}{UPDATE_PATH}\n")
}

/// Unit that publishes the machine's addresses where payload templating
/// expects them.
fn metadata_unit(private_ipv4: IpAddr, public_ipv4: IpAddr) -> String {
    format!(
        "[Unit]\n\
         Description=Fleet machine metadata\n\
         Before=network-online.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=yes\n\
         ExecStart=/usr/bin/mkdir -p /run/metadata\n\
         ExecStart=/usr/bin/bash -c 'printf \"COREOS_CUSTOM_PRIVATE_IPV4=%s\\nCOREOS_CUSTOM_PUBLIC_IPV4=%s\\n\" {private_ipv4} {public_ipv4} > /run/metadata/flatcar'\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn update_conf_points_at_cluster_responder() {
        let conf = update_conf(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 34568);
        assert!(conf.contains("SERVER=http://10.0.0.1:34568/v1/update/\n"));
    }

    #[test]
    fn metadata_unit_carries_both_addresses() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        let unit = metadata_unit(ip, ip);
        assert!(unit.contains("COREOS_CUSTOM_PRIVATE_IPV4=%s"));
        assert!(unit.contains("10.0.0.7 10.0.0.7 > /run/metadata/flatcar"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }
}
