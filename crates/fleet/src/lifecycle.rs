//! Boot, health-check and reboot logic shared by every backend.
//!
//! Backends own process start and teardown; everything that only needs an
//! SSH channel to the guest lives here.

use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::platform::Machine;
use crate::retry::retry_conditional;

/// What `systemctl is-system-running` reported.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SystemState {
    Running,
    /// Booted, but at least one unit failed.
    Degraded,
    /// Early boot, before units are queued.
    Initializing,
    /// Units still being started; worth waiting for.
    Starting,
    /// Anything else (`maintenance`, `stopping`, `offline`, ...).
    Other(String),
}

impl SystemState {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "running" => Self::Running,
            "degraded" => Self::Degraded,
            "initializing" | "" => Self::Initializing,
            "starting" => Self::Starting,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Block until the guest's service manager is ready and the guest is healthy.
///
/// Transient states are retried within the cluster's SSH budget. A state that
/// will not heal on its own fails immediately, except `degraded`, which goes
/// on to the failed-unit check so the error names the culprits. Once ready,
/// the guest must identify as the expected OS and, unless waived, report no
/// failed units.
pub async fn check_machine(machine: &dyn Machine) -> Result<()> {
    let config = machine.runtime_config();

    let state = retry_conditional(
        config.ssh_retries,
        config.ssh_retry_delay(),
        |e| !matches!(e, FleetError::Unhealthy { .. }),
        || system_ready(machine),
    )
    .await?;

    check_os_identity(machine).await?;

    let degraded = state == SystemState::Degraded;
    if degraded || !config.allow_failed_units {
        let units = list_failed_units(machine).await?;
        if units.is_empty() {
            if degraded {
                return Err(FleetError::Unhealthy {
                    id: machine.id().to_string(),
                    state: "degraded".into(),
                    detail: " with no failed units listed".into(),
                });
            }
        } else if config.allow_failed_units {
            warn!(id = machine.id(), ?units, "ignoring failed units");
        } else {
            return Err(failed_units_error(machine, units).await);
        }
    }

    info!(id = machine.id(), "machine healthy");
    Ok(())
}

/// Reboot the guest and wait for it to come back healthy.
///
/// The SSH listener is stopped first so the follow-up health check has to
/// reach a freshly booted system rather than a lingering old session.
pub async fn reboot_machine(machine: &dyn Machine) -> Result<()> {
    let id = machine.id();
    info!(id, "rebooting machine");

    match machine.ssh("sudo systemctl stop sshd.socket").await {
        Ok(out) if !out.success() => {
            debug!(id, stderr = %out.stderr.trim(), "stopping sshd.socket failed, continuing");
        }
        Ok(_) => {}
        Err(e) if is_session_terminated(&e) => {}
        Err(e) => return Err(e),
    }

    match machine.ssh("sudo systemctl reboot").await {
        Ok(_) => {}
        Err(e) if is_session_terminated(&e) => {
            debug!(id, error = %e, "session terminated by reboot");
        }
        Err(e) => {
            warn!(id, error = %e, "reboot command failed");
            return Err(e);
        }
    }

    check_machine(machine).await
}

/// Whether an SSH error is the connection dropping underneath a command.
///
/// OpenSSH exits with 255 when the remote end goes away; a missing status
/// means the client itself was killed by a signal.
pub(crate) fn is_session_terminated(e: &FleetError) -> bool {
    matches!(
        e,
        FleetError::Ssh {
            status: None | Some(255),
            ..
        }
    )
}

/// `Running` or `Degraded` once boot has finished; an error otherwise.
async fn system_ready(machine: &dyn Machine) -> Result<SystemState> {
    let id = machine.id();
    let out = machine.ssh("systemctl is-system-running").await?;
    match SystemState::parse(&out.stdout) {
        state @ (SystemState::Running | SystemState::Degraded) => Ok(state),
        SystemState::Initializing => Err(FleetError::NotReady {
            id: id.to_string(),
            detail: "system is initializing".into(),
        }),
        SystemState::Starting => {
            let jobs = match machine.ssh("systemctl list-jobs --no-pager").await {
                Ok(out) => out.stdout,
                Err(e) => format!("<list-jobs failed: {e}>"),
            };
            Err(FleetError::NotReady {
                id: id.to_string(),
                detail: format!("system is starting, pending jobs:\n{}", jobs.trim()),
            })
        }
        SystemState::Other(state) => Err(FleetError::Unhealthy {
            id: id.to_string(),
            state,
            detail: if out.stderr.trim().is_empty() {
                String::new()
            } else {
                format!(": {}", out.stderr.trim())
            },
        }),
    }
}

async fn check_os_identity(machine: &dyn Machine) -> Result<()> {
    let want = &machine.runtime_config().expected_os_id;
    let out = machine.ssh("grep ^ID= /etc/os-release").await?.check()?;
    let got = parse_os_id(&out);
    if got != want.as_str() {
        return Err(FleetError::WrongOs {
            id: machine.id().to_string(),
            got: out,
            want: want.clone(),
        });
    }
    Ok(())
}

fn parse_os_id(line: &str) -> &str {
    line.trim()
        .strip_prefix("ID=")
        .unwrap_or_default()
        .trim_matches('"')
}

async fn list_failed_units(machine: &dyn Machine) -> Result<Vec<String>> {
    let out = machine
        .ssh("systemctl list-units --state=failed --no-legend --plain --no-pager")
        .await?
        .check()?;
    Ok(parse_failed_units(&out))
}

/// Collect journal and status for each failed unit.
async fn failed_units_error(machine: &dyn Machine, units: Vec<String>) -> FleetError {
    let mut detail = String::new();
    for unit in &units {
        for cmd in [
            format!("journalctl --no-pager -b -u {unit}"),
            format!("systemctl status --no-pager {unit}"),
        ] {
            let text = match machine.ssh(&cmd).await {
                Ok(out) => out.stdout,
                Err(e) => format!("<failed: {e}>"),
            };
            detail.push_str(&format!("--- {cmd}\n{}\n", text.trim_end()));
        }
    }

    FleetError::FailedUnits {
        id: machine.id().to_string(),
        units,
        detail,
    }
}

fn parse_failed_units(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_state_parse() {
        assert_eq!(SystemState::parse("running\n"), SystemState::Running);
        assert_eq!(SystemState::parse("starting"), SystemState::Starting);
        assert_eq!(SystemState::parse(""), SystemState::Initializing);
        assert_eq!(SystemState::parse("degraded"), SystemState::Degraded);
        assert_eq!(
            SystemState::parse("maintenance"),
            SystemState::Other("maintenance".into())
        );
    }

    #[test]
    fn os_id_parsing_handles_quotes() {
        assert_eq!(parse_os_id("ID=flatcar"), "flatcar");
        assert_eq!(parse_os_id("ID=\"fedora\"\n"), "fedora");
        assert_eq!(parse_os_id("NAME=x"), "");
    }

    #[test]
    fn failed_units_parsing() {
        let out = "foo.service loaded failed failed Foo\nbar.mount loaded failed failed Bar\n";
        assert_eq!(parse_failed_units(out), vec!["foo.service", "bar.mount"]);
        assert!(parse_failed_units("").is_empty());
    }

    #[test]
    fn session_terminated_classification() {
        let dropped = FleetError::Ssh {
            command: "sudo systemctl reboot".into(),
            status: Some(255),
            stdout: String::new(),
            stderr: "Connection to 10.0.0.2 closed by remote host.".into(),
        };
        assert!(is_session_terminated(&dropped));
        let failed = FleetError::Ssh {
            command: "x".into(),
            status: Some(1),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!is_session_terminated(&failed));
        assert!(!is_session_terminated(&FleetError::InvalidConfig("x".into())));
    }
}
