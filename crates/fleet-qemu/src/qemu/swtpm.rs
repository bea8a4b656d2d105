use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use fleet::{FleetError, retry};
use tokio::process::{Child, Command};

use crate::process::{forward_output, terminate};

const SOCKET_ATTEMPTS: u32 = 50;
const SOCKET_POLL: Duration = Duration::from_millis(100);

/// Software TPM 2.0 serving one machine over a unix socket.
pub struct Swtpm {
    owner: String,
    socket: PathBuf,
    child: Child,
}

impl Swtpm {
    /// Start swtpm with state under `state_dir` and wait for its socket.
    pub async fn start(owner: &str, state_dir: &Path, socket: &Path) -> fleet::Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let mut child = Command::new("swtpm")
            .args(swtpm_args(state_dir, socket))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| FleetError::command("swtpm", e.to_string()))?;
        forward_output(owner, "swtpm", &mut child);

        let mut tpm = Self {
            owner: owner.to_string(),
            socket: socket.to_path_buf(),
            child,
        };
        let ready = retry(SOCKET_ATTEMPTS, SOCKET_POLL, move || async move {
            if tokio::fs::try_exists(socket).await.unwrap_or(false) {
                Ok(())
            } else {
                Err("socket not present")
            }
        })
        .await;
        if ready.is_err() {
            tpm.stop().await;
            return Err(FleetError::command(
                "swtpm",
                format!("socket {} never appeared", socket.display()),
            ));
        }
        Ok(tpm)
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub async fn stop(&mut self) {
        terminate(&self.owner, "swtpm", &mut self.child).await;
    }
}

fn swtpm_args(state_dir: &Path, socket: &Path) -> Vec<String> {
    vec![
        "socket".into(),
        "--tpm2".into(),
        "--tpmstate".into(),
        format!("dir={}", state_dir.display()),
        "--ctrl".into(),
        format!("type=unixio,path={}", socket.display()),
        "--terminate".into(),
    ]
}
