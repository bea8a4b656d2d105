use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{MachineOptions, RuntimeConfig};
use crate::error::{FleetError, Result};
use crate::userdata::UserData;

/// Lifecycle of a single machine.
///
/// ```text
///   Created → Booting → Running ⇄ Rebooting
///                │          │         │
///                └──────────┼─────────┴──→ Failed
///                           ↓
///                       Destroyed
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Created = 0,
    Booting = 1,
    Running = 2,
    Rebooting = 3,
    Failed = 4,
    Destroyed = 5,
}

impl MachineState {
    pub fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 5, "invalid MachineState: {v}");
        match v {
            0 => Self::Created,
            1 => Self::Booting,
            2 => Self::Running,
            3 => Self::Rebooting,
            4 => Self::Failed,
            _ => Self::Destroyed,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Booting => f.write_str("booting"),
            Self::Running => f.write_str("running"),
            Self::Rebooting => f.write_str("rebooting"),
            Self::Failed => f.write_str("failed"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// How to authenticate an SSH round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshCredentials {
    /// The flight's generated key as the cluster's default user.
    FleetKey,
    /// The flight's generated key as a named user.
    User(String),
    Password { user: String, password: String },
}

/// Output of a command that ran to completion on the guest.
///
/// A non-zero exit status is not a transport error, so it is reported here
/// rather than as `Err`; [`SshOutput::check`] turns it into one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub status: Option<i32>,
}

impl SshOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Return trimmed stdout, or an error carrying the full output.
    pub fn check(self) -> Result<String> {
        if self.success() {
            Ok(self.stdout.trim().to_string())
        } else {
            Err(FleetError::Ssh {
                command: self.command,
                status: self.status,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// One supervised virtual machine reachable over SSH.
#[async_trait]
pub trait Machine: Send + Sync {
    fn id(&self) -> &str;
    /// Address reachable from the test runner.
    fn ip(&self) -> IpAddr;
    /// Address on the fleet's private network.
    fn private_ip(&self) -> IpAddr;
    fn runtime_config(&self) -> &RuntimeConfig;
    fn state(&self) -> MachineState;

    /// Run `cmd` with the fleet's default credentials.
    async fn ssh(&self, cmd: &str) -> Result<SshOutput>;
    async fn ssh_with(&self, credentials: &SshCredentials, cmd: &str) -> Result<SshOutput>;

    /// Restart the guest and block until it passes the health check again.
    async fn reboot(&self) -> Result<()>;

    /// Release every OS resource; captured diagnostics stay readable.
    ///
    /// Idempotent. Failures are logged, never returned.
    async fn destroy(&self);

    fn console_output(&self) -> String;
    fn journal_output(&self) -> String;
}

/// A named group of machines sharing one flight's network.
#[async_trait]
pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;
    fn runtime_config(&self) -> &RuntimeConfig;

    async fn new_machine(&self, userdata: Option<UserData>) -> Result<Arc<dyn Machine>> {
        self.new_machine_with_options(userdata, MachineOptions::default())
            .await
    }

    async fn new_machine_with_options(
        &self,
        userdata: Option<UserData>,
        options: MachineOptions,
    ) -> Result<Arc<dyn Machine>>;

    /// Point-in-time snapshot of the live machines.
    fn machines(&self) -> Vec<Arc<dyn Machine>>;

    /// Console text of machines already destroyed, keyed by machine id.
    fn console_outputs(&self) -> HashMap<String, String>;

    /// Destroy every tracked machine, best-effort.
    async fn destroy(&self);
}

/// Top-level owner of a test run's shared resources.
#[async_trait]
pub trait Flight: Send + Sync {
    fn name(&self) -> &str;
    /// Backend identifier (e.g. `qemu`).
    fn platform(&self) -> &'static str;

    async fn new_cluster(&self, config: RuntimeConfig) -> Result<Arc<dyn Cluster>>;

    /// Release all flight resources in reverse acquisition order.
    async fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_state_roundtrips_through_u8() {
        for state in [
            MachineState::Created,
            MachineState::Booting,
            MachineState::Running,
            MachineState::Rebooting,
            MachineState::Failed,
            MachineState::Destroyed,
        ] {
            assert_eq!(MachineState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn check_returns_trimmed_stdout() {
        let out = SshOutput {
            command: "echo hi".into(),
            stdout: "hi\n".into(),
            stderr: String::new(),
            status: Some(0),
        };
        assert_eq!(out.check().unwrap(), "hi");
    }

    #[test]
    fn check_keeps_output_on_failure() {
        let out = SshOutput {
            command: "false".into(),
            stdout: "partial".into(),
            stderr: "boom".into(),
            status: Some(1),
        };
        match out.check().unwrap_err() {
            FleetError::Ssh {
                command,
                status,
                stdout,
                stderr,
            } => {
                assert_eq!(command, "false");
                assert_eq!(status, Some(1));
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
