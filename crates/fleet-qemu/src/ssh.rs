//! SSH transport to guests, run from inside the flight namespace.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use fleet::{FleetError, SshCredentials, SshOutput};
use tokio::process::Command;
use tracing::trace;

use crate::netns::NetNs;

/// Exit status ssh reserves for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Guests are throwaway; their host keys are never worth remembering.
const COMMON_OPTIONS: &[&str] = &[
    "StrictHostKeyChecking=no",
    "UserKnownHostsFile=/dev/null",
    "LogLevel=ERROR",
    "ServerAliveInterval=10",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Auth<'a> {
    Key(&'a Path),
    Password,
}

/// Runs commands on guests with the fleet key or a password.
#[derive(Debug)]
pub struct SshClient {
    ns: Arc<NetNs>,
    key: PathBuf,
    default_user: String,
    timeout: Duration,
}

impl SshClient {
    pub fn new(ns: Arc<NetNs>, key: PathBuf, default_user: String, timeout: Duration) -> Self {
        Self {
            ns,
            key,
            default_user,
            timeout,
        }
    }

    /// An `ssh` invocation of `remote` on `ip`, not yet spawned.
    pub fn command(&self, ip: IpAddr, credentials: &SshCredentials, remote: &str) -> Command {
        match credentials {
            SshCredentials::FleetKey => {
                let mut cmd = self.ns.command("ssh");
                cmd.args(ssh_args(
                    Auth::Key(&self.key),
                    &self.default_user,
                    ip,
                    self.timeout,
                    remote,
                ));
                cmd
            }
            SshCredentials::User(user) => {
                let mut cmd = self.ns.command("ssh");
                cmd.args(ssh_args(Auth::Key(&self.key), user, ip, self.timeout, remote));
                cmd
            }
            SshCredentials::Password { user, password } => {
                let mut cmd = self.ns.command("sshpass");
                cmd.args(["-e", "ssh"])
                    .args(ssh_args(Auth::Password, user, ip, self.timeout, remote))
                    .env("SSHPASS", password);
                cmd
            }
        }
    }

    /// Run `remote` to completion.
    ///
    /// `Err` means the command never ran (or the session was torn down);
    /// a command that ran and failed comes back as `Ok` with its status.
    pub async fn run(
        &self,
        ip: IpAddr,
        credentials: &SshCredentials,
        remote: &str,
    ) -> fleet::Result<SshOutput> {
        trace!(%ip, command = remote, "ssh");
        let output = self
            .command(ip, credentials, remote)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FleetError::Ssh {
                command: remote.to_string(),
                status: None,
                stdout: String::new(),
                stderr: e.to_string(),
            })?;

        let out = SshOutput {
            command: remote.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        };
        match out.status {
            Some(SSH_TRANSPORT_FAILURE) | None => Err(FleetError::Ssh {
                command: out.command,
                status: out.status,
                stdout: out.stdout,
                stderr: out.stderr,
            }),
            Some(_) => Ok(out),
        }
    }
}

fn ssh_args(auth: Auth<'_>, user: &str, ip: IpAddr, timeout: Duration, remote: &str) -> Vec<String> {
    let mut args = Vec::new();
    for opt in COMMON_OPTIONS {
        args.push("-o".to_string());
        args.push((*opt).to_string());
    }
    args.push("-o".to_string());
    args.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
    match auth {
        Auth::Key(key) => {
            args.extend(
                [
                    "-o",
                    "BatchMode=yes",
                    "-o",
                    "IdentitiesOnly=yes",
                    "-o",
                    "PasswordAuthentication=no",
                    "-i",
                ]
                .map(String::from),
            );
            args.push(key.display().to_string());
        }
        Auth::Password => {
            args.extend(
                [
                    "-o",
                    "PubkeyAuthentication=no",
                    "-o",
                    "PreferredAuthentications=password",
                ]
                .map(String::from),
            );
        }
    }
    args.push(format!("{user}@{ip}"));
    args.push("--".to_string());
    args.push(remote.to_string());
    args
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn key_auth_targets_user_at_ip() {
        let args = ssh_args(
            Auth::Key(Path::new("/out/id_ed25519")),
            "core",
            IP,
            Duration::from_secs(10),
            "uptime",
        );
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/out/id_ed25519");
        assert_eq!(args[args.len() - 3..], ["core@10.0.0.2", "--", "uptime"]);
    }

    #[test]
    fn password_auth_never_offers_keys() {
        let args = ssh_args(Auth::Password, "tester", IP, Duration::from_secs(5), "true");
        assert!(args.contains(&"PubkeyAuthentication=no".to_string()));
        assert!(!args.contains(&"-i".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"tester@10.0.0.2".to_string()));
    }

    #[test]
    fn sub_second_timeout_rounds_up() {
        let args = ssh_args(Auth::Password, "core", IP, Duration::from_millis(200), "true");
        assert!(args.contains(&"ConnectTimeout=1".to_string()));
    }
}
