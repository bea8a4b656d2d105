//! Background capture of a guest's journal into its machine directory.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use fleet::SshCredentials;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::terminate;
use crate::ssh::SshClient;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const FOLLOW_COMMAND: &str = "journalctl --no-pager --boot --lines=all --follow";
const RECONNECT_MARKER: &[u8] = b"-- journal stream reconnected --\n";

/// A running `journalctl -f` over SSH, appended to a file.
///
/// The stream reconnects after the guest drops the session (reboots do) until
/// the token is cancelled.
pub struct JournalCapture {
    path: PathBuf,
    shutdown: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl JournalCapture {
    pub fn start(
        shutdown: CancellationToken,
        ssh: Arc<SshClient>,
        id: String,
        ip: IpAddr,
        path: PathBuf,
    ) -> Self {
        let task = tokio::spawn(follow(shutdown.clone(), ssh, id, ip, path.clone()));
        Self {
            path,
            shutdown,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop streaming and wait for the file to be flushed. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(path = %self.path.display(), error = %e, "journal task failed");
        }
    }
}

async fn follow(
    shutdown: CancellationToken,
    ssh: Arc<SshClient>,
    id: String,
    ip: IpAddr,
    path: PathBuf,
) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(id = %id, path = %path.display(), error = %e, "cannot open journal file");
            return;
        }
    };

    let mut first = true;
    while !shutdown.is_cancelled() {
        if !first && let Err(e) = file.write_all(RECONNECT_MARKER).await {
            warn!(id = %id, error = %e, "journal write failed");
            break;
        }
        first = false;

        let mut child = match ssh
            .command(ip, &SshCredentials::FleetKey, FOLLOW_COMMAND)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(id = %id, error = %e, "failed to start journal stream");
                break;
            }
        };

        if let Some(mut stdout) = child.stdout.take() {
            tokio::select! {
                result = tokio::io::copy(&mut stdout, &mut file) => {
                    debug!(id = %id, ?result, "journal stream ended");
                }
                () = shutdown.cancelled() => {}
            }
        }
        terminate(&id, "journal", &mut child).await;

        tokio::select! {
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
            () = shutdown.cancelled() => {}
        }
    }

    if let Err(e) = file.flush().await {
        warn!(id = %id, error = %e, "journal flush failed");
    }
}

