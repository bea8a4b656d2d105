use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. Killing the group also takes down the real program
/// that `ip netns exec` replaced itself with. No-op if the child has already
/// exited or the PID cannot be represented as `i32`.
pub(crate) fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

/// Kill and reap a supervised child.
pub(crate) async fn terminate(owner: &str, what: &str, child: &mut Child) {
    kill_process_group(child);
    match child.wait().await {
        Ok(status) => debug!(id = %owner, what, %status, "process reaped"),
        Err(e) => warn!(id = %owner, what, error = %e, "failed to reap process"),
    }
}

/// Forward a child's stdout/stderr into the log, one event per line.
pub(crate) fn forward_output(owner: &str, what: &'static str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let id = owner.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(id = %id, what, "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let id = owner.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(id = %id, what, "stderr: {line}");
                }
            }
        });
    }
}
