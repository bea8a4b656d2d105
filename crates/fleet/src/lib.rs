mod bulk;
mod config;
mod error;
mod lifecycle;
mod platform;
mod retry;
mod userdata;

pub use bulk::new_machines;
pub use config::{DiskSource, DiskSpec, MachineOptions, RuntimeConfig, parse_size};
pub use error::{FleetError, Result};
pub use lifecycle::{check_machine, reboot_machine};
pub use platform::{Cluster, Flight, Machine, MachineState, SshCredentials, SshOutput};
pub use retry::{retry, retry_conditional};
pub use userdata::{PayloadTransport, RenderedUserData, UserData};
