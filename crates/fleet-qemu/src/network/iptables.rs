//! Host firewall rules for a flight's uplink.
//!
//! Every rule carries the flight's namespace name as an iptables comment, so
//! teardown (or a later run cleaning up after a crash) can find them again
//! without keeping state.

use tracing::trace;

use crate::command::{exec, exec_ignore_errors};

use super::Result;

/// Masquerade and forward the uplink subnet out of `default_iface`.
pub(crate) async fn add_host_nat(
    comment: &str,
    uplink_device: &str,
    uplink_subnet: &str,
    default_iface: &str,
) -> Result<()> {
    for rule in host_nat_rules(comment, uplink_device, uplink_subnet, default_iface) {
        let args: Vec<&str> = rule.iter().map(String::as_str).collect();
        exec("iptables", &args).await?;
    }
    Ok(())
}

fn host_nat_rules(
    comment: &str,
    uplink_device: &str,
    uplink_subnet: &str,
    default_iface: &str,
) -> Vec<Vec<String>> {
    let tagged = |rule: &[&str]| -> Vec<String> {
        rule.iter()
            .chain(&["-m", "comment", "--comment", comment])
            .map(|s| (*s).to_string())
            .collect()
    };
    vec![
        tagged(&[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            uplink_subnet,
            "-o",
            default_iface,
            "-j",
            "MASQUERADE",
        ]),
        tagged(&[
            "-A",
            "FORWARD",
            "-i",
            uplink_device,
            "-o",
            default_iface,
            "-j",
            "ACCEPT",
        ]),
        tagged(&[
            "-A",
            "FORWARD",
            "-i",
            default_iface,
            "-o",
            uplink_device,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
    ]
}

/// Delete iptables rules that contain `comment` in nat and filter tables.
pub(crate) async fn delete_rules_by_comment(comment: &str) {
    let ((), ()) = tokio::join!(
        delete_from_table("nat", comment),
        delete_from_table("filter", comment),
    );
}

async fn delete_from_table(table: &str, comment: &str) {
    let output = match exec("iptables-save", &["-t", table]).await {
        Ok(output) => output,
        Err(e) => {
            trace!(table, error = %e, "failed to read iptables rules, skipping cleanup");
            return;
        }
    };
    // Sequential: xtables lock serializes writes to the same table anyway.
    for rule in deletions(&output, comment) {
        let mut args: Vec<&str> = vec!["-t", table];
        args.extend(rule.split_whitespace().map(|t| t.trim_matches('"')));
        exec_ignore_errors("iptables", &args).await;
    }
}

/// Turn matching `-A` lines of `iptables-save` output into `-D` rules.
///
/// Comments are namespace names and never contain spaces, so splitting on
/// whitespace afterwards is safe.
fn deletions(save_output: &str, comment: &str) -> Vec<String> {
    save_output
        .lines()
        .filter(|line| line.starts_with("-A ") && line.split_whitespace().any(|t| t.trim_matches('"') == comment))
        .map(|line| line.replacen("-A ", "-D ", 1))
        .collect()
}
