use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use async_trait::async_trait;
use fleet::{Cluster, Flight, FleetError, RuntimeConfig};
use futures_util::FutureExt;
use tracing::{info, warn};

use crate::cluster::QemuCluster;
use crate::command::exec;
use crate::config::QemuFlightConfig;
use crate::destructors::Destructors;
use crate::netns::NetNs;
use crate::network::VirtualLan;
use crate::paths::FlightPaths;
use crate::prerequisites::check_prerequisites;
use crate::qemu::{BoardProfile, host_board_profile};
use crate::services::{KvStore, start_file_server, start_kv, start_ntp, start_omaha};

const KV_PORT: u16 = 2379;
const NTP_PORT: u16 = 123;
const FILES_PORT: u16 = 80;
/// First update-ping port; each cluster takes the next one.
const FIRST_OMAHA_PORT: u16 = 34567;

/// Everything a flight owns, shared with its clusters and machines.
pub(crate) struct FlightInner {
    pub(crate) name: String,
    pub(crate) config: QemuFlightConfig,
    pub(crate) profile: BoardProfile,
    pub(crate) paths: FlightPaths,
    pub(crate) ns: Arc<NetNs>,
    pub(crate) lan: Arc<VirtualLan>,
    pub(crate) bridge_ip: IpAddr,
    pub(crate) kv: Arc<KvStore>,
    pub(crate) ssh_public_key: String,
    next_omaha_port: AtomicU16,
    next_cluster: AtomicU32,
    destructors: Destructors,
}

impl FlightInner {
    pub(crate) fn allocate_omaha_port(&self) -> fleet::Result<u16> {
        let port = self.next_omaha_port.fetch_add(1, Ordering::Relaxed);
        if port < FIRST_OMAHA_PORT {
            return Err(FleetError::Service {
                name: "omaha".into(),
                detail: "update-ping ports exhausted".into(),
            });
        }
        Ok(port)
    }

    pub(crate) fn next_cluster_name(&self) -> String {
        let n = self.next_cluster.fetch_add(1, Ordering::Relaxed);
        format!("{}-c{n}", self.name)
    }
}

/// A flight on the local host: one network namespace with its LAN, services
/// and SSH key.
pub struct QemuFlight {
    inner: Arc<FlightInner>,
}

struct FlightParts {
    ns: Arc<NetNs>,
    lan: Arc<VirtualLan>,
    bridge_ip: IpAddr,
    kv: Arc<KvStore>,
    ssh_public_key: String,
}

impl QemuFlight {
    /// Build the namespace, LAN and services.
    ///
    /// On failure everything created so far is released, newest first,
    /// before the error is returned.
    pub async fn new(config: QemuFlightConfig) -> fleet::Result<Self> {
        config.validate()?;
        let profile = host_board_profile(&config.board)?;
        check_prerequisites(&config, &profile)?;

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| generate_name(&uuid::Uuid::new_v4()));
        let paths = FlightPaths::new(config.base_dir.join(&name));
        tokio::fs::create_dir_all(paths.dir()).await?;

        let destructors = Destructors::new();
        let parts = match setup(&name, &config, &paths, &destructors).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(flight = %name, error = %e, "flight setup failed, releasing");
                destructors.release().await;
                return Err(e);
            }
        };

        info!(flight = %name, bridge = %parts.bridge_ip, "flight ready");
        Ok(Self {
            inner: Arc::new(FlightInner {
                name,
                config,
                profile,
                paths,
                ns: parts.ns,
                lan: parts.lan,
                bridge_ip: parts.bridge_ip,
                kv: parts.kv,
                ssh_public_key: parts.ssh_public_key,
                next_omaha_port: AtomicU16::new(FIRST_OMAHA_PORT),
                next_cluster: AtomicU32::new(0),
                destructors,
            }),
        })
    }

    /// The flight's coordination store, as guests see it.
    pub fn kv(&self) -> &Arc<KvStore> {
        &self.inner.kv
    }

    pub fn lan(&self) -> &Arc<VirtualLan> {
        &self.inner.lan
    }
}

async fn setup(
    name: &str,
    config: &QemuFlightConfig,
    paths: &FlightPaths,
    destructors: &Destructors,
) -> fleet::Result<FlightParts> {
    let ns = Arc::new(NetNs::create(name).await?);
    {
        let ns = Arc::clone(&ns);
        destructors
            .push("netns", move || async move { ns.destroy().await }.boxed())
            .await;
    }

    let lan = Arc::new(
        VirtualLan::new(
            Arc::clone(&ns),
            config.segments,
            config.leases_per_segment,
            paths.dir(),
        )
        .await?,
    );
    {
        let lan = Arc::clone(&lan);
        destructors
            .push("lan", move || async move { lan.destroy().await }.boxed())
            .await;
    }

    let bridge_ip = lan
        .bridge_ip()
        .ok_or_else(|| FleetError::InvalidConfig("flight has no segments".into()))?;

    let (kv_handle, kv) = start_kv(&ns, SocketAddr::new(bridge_ip, KV_PORT)).await?;
    destructors
        .push("kv", move || async move { kv_handle.stop().await }.boxed())
        .await;

    let ntp = start_ntp(&ns, SocketAddr::new(bridge_ip, NTP_PORT)).await?;
    destructors
        .push("ntp", move || async move { ntp.stop().await }.boxed())
        .await;

    if let Some(root) = &config.file_root {
        let files = start_file_server(&ns, SocketAddr::new(bridge_ip, FILES_PORT), root).await?;
        destructors
            .push("files", move || async move { files.stop().await }.boxed())
            .await;
    }

    let ssh_public_key = generate_ssh_key(name, paths).await?;

    Ok(FlightParts {
        ns,
        lan,
        bridge_ip,
        kv,
        ssh_public_key,
    })
}

/// Create the flight's ed25519 key pair and return the public half.
async fn generate_ssh_key(name: &str, paths: &FlightPaths) -> fleet::Result<String> {
    let key = paths.ssh_key();
    let key_str = key.to_string_lossy();
    if !tokio::fs::try_exists(&key).await.unwrap_or(false) {
        exec(
            "ssh-keygen",
            &["-q", "-t", "ed25519", "-N", "", "-C", name, "-f", &key_str],
        )
        .await?;
    }
    let public = tokio::fs::read_to_string(paths.ssh_public_key()).await?;
    Ok(public.trim().to_string())
}

fn generate_name(id: &uuid::Uuid) -> String {
    let simple = id.simple().to_string();
    format!("fleet-{}", simple.get(..8).unwrap_or(&simple))
}

#[async_trait]
impl Flight for QemuFlight {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn platform(&self) -> &'static str {
        "qemu"
    }

    async fn new_cluster(&self, config: RuntimeConfig) -> fleet::Result<Arc<dyn Cluster>> {
        let inner = &self.inner;
        tokio::fs::create_dir_all(&config.output_dir).await?;
        let port = inner.allocate_omaha_port()?;
        let (omaha, responder) =
            start_omaha(&inner.ns, SocketAddr::new(inner.bridge_ip, port)).await?;
        let cluster = QemuCluster::new(Arc::clone(inner), config, omaha, responder);
        info!(cluster = %cluster.name(), port, "cluster created");
        Ok(Arc::new(cluster))
    }

    async fn destroy(&self) {
        self.inner.destructors.release().await;
        info!(flight = %self.inner.name, "flight destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_fit_interface_limits() {
        let name = generate_name(&uuid::Uuid::new_v4());
        assert!(name.starts_with("fleet-"));
        assert_eq!(name.len(), 14);
    }
}
