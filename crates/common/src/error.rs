use thiserror::Error;

use crate::state::InstallState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Installation {0} has expired")]
    Expired(uuid::Uuid),

    #[error("Installation {uuid} is in state {state}, cannot transition to {target}")]
    StateConflict {
        uuid: uuid::Uuid,
        state: InstallState,
        target: InstallState,
    },

    #[error("Appliance unreachable: {0}")]
    ApplianceUnreachable(String),

    #[error("Appliance protocol error: {0}")]
    ApplianceProtocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("System has no appliance associated")]
    SystemWithoutAppliance,

    #[error("System has no UID set")]
    SystemWithoutUid,

    #[error("Unsupported appliance URI scheme: {0}")]
    UnsupportedUriScheme(String),

    #[error("Invalid hardware address: {0}")]
    InvalidHwAddr(String),

    #[error("Cannot compile regular expression '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Malformed boot path: {0}")]
    MalformedPath(String),

    #[error("Access outside of the root directory: {0}")]
    OutsideRoot(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Not-found and expired are the recoverable outcomes of a lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Expired(_))
    }

    /// Errors raised by an appliance driver talking to its endpoint or
    /// refusing to act on an incompletely registered system.
    pub fn is_appliance_error(&self) -> bool {
        matches!(
            self,
            Error::ApplianceUnreachable(_)
                | Error::ApplianceProtocol(_)
                | Error::SystemWithoutAppliance
                | Error::SystemWithoutUid
                | Error::UnsupportedUriScheme(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
