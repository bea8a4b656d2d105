use fleet::FleetError;

use crate::command::CommandError;

use super::veth::VethPairError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("namespace {name}: {detail}")]
    Namespace { name: String, detail: String },

    #[error("no default interface found in route output: {0}")]
    NoDefaultInterface(String),

    #[error("parse host addresses: {0}")]
    HostAddresses(String),

    #[error(transparent)]
    Veth(#[from] VethPairError),

    #[error("no free veth address after {0} attempts")]
    SeedsExhausted(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

impl From<NetworkError> for FleetError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Command(e) => e.into(),
            NetworkError::Veth(e) => e.into(),
            NetworkError::Io(e) => FleetError::Io(e),
            NetworkError::Namespace { name, detail } => {
                FleetError::Namespace(format!("{name}: {detail}"))
            }
            NetworkError::SeedsExhausted(n) => {
                FleetError::AddressClash(format!("no free veth address after {n} attempts"))
            }
            other => FleetError::BackendNotAvailable(other.to_string()),
        }
    }
}
