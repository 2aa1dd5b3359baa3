//! Driver-facing seam: the statements a connection can run and the errors a
//! driver reports back.

use crate::time::{format_expiration, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// The session's socket is gone.
    ConnectionClosed,
    NetworkReset,
    /// Credentials the connection was opened with are no longer accepted.
    AuthExpired,
    /// The driver process/plugin has shut down underneath the handle.
    PluginShutdown,
    /// The target account does not exist.
    UserNotFound,
    /// The database rejected the statement itself.
    Rejected,
    Timeout,
    Other,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub message: String,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Values a driver binds into a statement template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementParams {
    pub name: String,
    pub expiration: Option<String>,
}

impl StatementParams {
    pub fn for_user(username: &str) -> Self {
        Self {
            name: username.to_string(),
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, expiration: &Timestamp) -> Self {
        self.expiration = Some(format_expiration(expiration));
        self
    }
}

/// A live database session.
///
/// Revocation statements are expected to tolerate an account that no longer
/// exists; a driver that cannot express that should report
/// [`DatabaseErrorKind::UserNotFound`] instead.
#[async_trait]
pub trait Database: Send + Sync + std::fmt::Debug {
    async fn execute(&self, statement: &str, params: &StatementParams)
        -> Result<(), DatabaseError>;

    async fn close(&self) -> Result<(), DatabaseError>;
}

/// Per-database connection settings, persisted under `config/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub plugin_name: String,
    #[serde(default)]
    pub connection_url: String,
}

impl ConnectionConfig {
    pub fn new(plugin_name: impl Into<String>, connection_url: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            connection_url: connection_url.into(),
        }
    }
}

/// Opens driver sessions for a named database.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Database>, DatabaseError>;
}

/// Decides whether a statement failure means the session is unusable.
pub trait ErrorClassifier: Send + Sync + std::fmt::Debug {
    fn is_connection_fatal(&self, err: &DatabaseError) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

const FATAL_MESSAGES: &[&str] = &[
    "connection reset",
    "broken pipe",
    "connection refused",
    "connection is closed",
    "plugin shutdown",
];

impl ErrorClassifier for DefaultClassifier {
    fn is_connection_fatal(&self, err: &DatabaseError) -> bool {
        match err.kind {
            DatabaseErrorKind::ConnectionClosed
            | DatabaseErrorKind::NetworkReset
            | DatabaseErrorKind::AuthExpired
            | DatabaseErrorKind::PluginShutdown => true,
            DatabaseErrorKind::Other => {
                let msg = err.message.to_lowercase();
                FATAL_MESSAGES.iter().any(|m| msg.contains(m))
            }
            _ => false,
        }
    }
}
