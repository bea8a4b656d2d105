use fleet::FleetError;
use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command} (status {status:?})\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub status: Option<i32>,
    pub detail: String,
}

impl From<CommandError> for FleetError {
    fn from(e: CommandError) -> Self {
        FleetError::Command {
            command: e.command,
            status: e.status,
            detail: e.detail,
        }
    }
}

/// Format a human-readable display string for a direct command invocation.
pub(crate) fn format_command_display(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Execute a command in the caller's network namespace.
///
/// Returns trimmed stdout on success.
pub async fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run(cmd, format_command_display(program, args)).await
}

/// Execute a command, ignoring any errors.
pub async fn exec_ignore_errors(program: &str, args: &[&str]) {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run_ignore_errors(cmd, format_command_display(program, args)).await;
}

/// Run a prepared command, capturing its output.
pub(crate) async fn run(mut cmd: Command, cmd_display: String) -> Result<String, CommandError> {
    trace!(command = %cmd_display, "exec");

    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            status: None,
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            status: output.status.code(),
            detail: stderr,
        })
    }
}

pub(crate) async fn run_ignore_errors(mut cmd: Command, cmd_display: String) {
    trace!(command = %cmd_display, "exec_ignore_errors");

    match cmd.stdin(std::process::Stdio::null()).output().await {
        Ok(o) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            trace!(command = %cmd_display, stderr = %stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_command_display_joins_args() {
        let display = format_command_display("qemu-img", &["create", "-f", "qcow2", "/tmp/x"]);
        assert_eq!(display, "qemu-img create -f qcow2 /tmp/x");
    }

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let output = exec("echo", &["hello"]).await.unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn exec_captures_multiline_output() {
        let output = exec("printf", &["a\\nb\\nc"]).await.unwrap();
        assert_eq!(output, "a\nb\nc");
    }

    #[tokio::test]
    async fn exec_error_carries_status_and_stderr() {
        let err = exec("bash", &["-c", "echo oops >&2; exit 3"])
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(3));
        assert!(err.detail.contains("oops"), "detail was: {}", err.detail);
    }

    #[tokio::test]
    async fn exec_spawn_failure_has_no_status() {
        let err = exec("/nonexistent/fleet-binary", &[]).await.unwrap_err();
        assert_eq!(err.status, None);
    }

    #[tokio::test]
    async fn exec_ignore_errors_does_not_panic_on_failure() {
        exec_ignore_errors("false", &[]).await;
    }

    #[test]
    fn command_error_converts_to_fleet_error() {
        let e = CommandError {
            command: "ip link".into(),
            status: Some(2),
            detail: "RTNETLINK answers: File exists".into(),
        };
        match FleetError::from(e) {
            FleetError::Command { status, detail, .. } => {
                assert_eq!(status, Some(2));
                assert!(detail.contains("File exists"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
