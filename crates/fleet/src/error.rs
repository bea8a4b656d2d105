/// Errors surfaced by fleet backends.
///
/// Variants are grouped by how callers should react: configuration errors are
/// rejected before any OS resource is touched, contention errors have already
/// been retried, and guest health errors carry enough output to diagnose
/// without re-running.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown board: {0}")]
    UnknownBoard(String),

    #[error("invalid disk spec: {0}")]
    DiskSpec(String),

    #[error("address clash: {0}")]
    AddressClash(String),

    #[error("invalid seed {0}: must be within 0-65535")]
    InvalidSeed(u32),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("command failed: {command} (status {status:?})\n{detail}")]
    Command {
        command: String,
        status: Option<i32>,
        detail: String,
    },

    #[error("ssh {command:?} failed (status {status:?}): {stdout}: {stderr}")]
    Ssh {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("machine {id} not ready: {detail}")]
    NotReady { id: String, detail: String },

    #[error("machine {id} entered unrecoverable state {state:?}{detail}")]
    Unhealthy {
        id: String,
        state: String,
        detail: String,
    },

    #[error("machine {id} is not running the expected OS: got {got:?}, want ID={want}")]
    WrongOs { id: String, got: String, want: String },

    #[error("machine {id} has failed units {units:?}\n{detail}")]
    FailedUnits {
        id: String,
        units: Vec<String>,
        detail: String,
    },

    #[error("service {name}: {detail}")]
    Service { name: String, detail: String },

    #[error("machine creation failed: {0}")]
    CreationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Short constructor for [`FleetError::Command`] without an exit status.
    pub fn command(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            status: None,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
