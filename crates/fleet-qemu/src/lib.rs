//! Local QEMU backend for `fleet`.
//!
//! A [`QemuFlight`] owns one network namespace holding a bridged LAN with
//! DHCP/DNS, NAT to the host and a handful of services guests talk to.
//! Clusters and machines created from it boot QEMU processes attached to
//! that LAN and are reached over SSH from inside the namespace.
//!
//! Requires root.

mod cluster;
mod command;
mod config;
mod destructors;
mod dialer;
mod flight;
mod journal;
mod machine;
mod netns;
pub mod network;
mod paths;
mod prerequisites;
mod process;
pub mod qemu;
pub mod services;
mod ssh;

pub use cluster::QemuCluster;
pub use command::{CommandError, exec, exec_ignore_errors};
pub use config::QemuFlightConfig;
pub use dialer::NsDialer;
pub use flight::QemuFlight;
pub use journal::JournalCapture;
pub use machine::QemuMachine;
pub use netns::{NetNs, NsGuard};
pub use paths::{FlightPaths, MachinePaths};
pub use prerequisites::{check_prerequisites, check_swtpm};
pub use ssh::SshClient;
