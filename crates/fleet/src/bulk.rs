use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{FleetError, Result};
use crate::platform::{Cluster, Machine};
use crate::userdata::UserData;

/// Create `n` machines in parallel, all or nothing.
///
/// If any creation fails, every machine that did come up is destroyed before
/// the combined error is returned.
pub async fn new_machines(
    cluster: Arc<dyn Cluster>,
    userdata: Option<UserData>,
    n: usize,
) -> Result<Vec<Arc<dyn Machine>>> {
    let mut set = JoinSet::new();
    for _ in 0..n {
        let cluster = Arc::clone(&cluster);
        let userdata = userdata.clone();
        set.spawn(async move { cluster.new_machine(userdata).await });
    }

    let mut machines = Vec::with_capacity(n);
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(machine)) => machines.push(machine),
            Ok(Err(e)) => errors.push(e.to_string()),
            Err(e) => errors.push(format!("creation task failed: {e}")),
        }
    }

    if errors.is_empty() {
        info!(cluster = cluster.name(), count = n, "machines created");
        return Ok(machines);
    }

    warn!(
        cluster = cluster.name(),
        failed = errors.len(),
        created = machines.len(),
        "bulk creation failed, destroying created machines"
    );
    let mut teardown = JoinSet::new();
    for machine in machines {
        teardown.spawn(async move { machine.destroy().await });
    }
    while teardown.join_next().await.is_some() {}

    Err(FleetError::CreationFailed(errors.join("; ")))
}
