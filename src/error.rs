use crate::database::DatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Secret is missing {key:?} internal data")]
    MissingAttribute { key: &'static str },

    #[error("Could not find role with name {role:?}")]
    RoleNotFound { role: String },

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Statement execution failed on database {db_name:?}: {source}")]
    StatementExecution {
        db_name: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("TTL out of range: {0:?}")]
    InvalidTtl(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification handed back to the lease scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingAttribute,
    RoleNotFound,
    Resolution,
    StatementExecution,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAttribute { .. } => ErrorKind::MissingAttribute,
            Error::RoleNotFound { .. } => ErrorKind::RoleNotFound,
            Error::StatementExecution { .. } => ErrorKind::StatementExecution,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
            Error::Resolution(_)
            | Error::InvalidTtl(_)
            | Error::Config(_)
            | Error::Serialization(_)
            | Error::Io(_) => ErrorKind::Resolution,
        }
    }

    /// Whether a later attempt of the same operation can succeed.
    ///
    /// A corrupted lease, a deleted role, an out-of-range TTL or a bad
    /// configuration never heals on its own; an operator has to step in.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidTtl(_) | Error::Config(_))
            && !matches!(
                self.kind(),
                ErrorKind::MissingAttribute | ErrorKind::RoleNotFound
            )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
