#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

//! Renewal and revocation of dynamic database credentials.
//!
//! A lease scheduler calls [`SecretLifecycle::renew`] and
//! [`SecretLifecycle::revoke`] for credentials issued by a database secrets
//! engine. Each call re-reads the credential's role, resolves the role's
//! database connection through the [`ConnectionRegistry`], and runs the
//! role's statements under shared access to that connection.

pub mod backend;
pub mod config;
pub mod connection;
pub mod context;
pub mod database;
pub mod error;
pub mod lease;
pub mod role;
pub mod storage;
pub mod time;

pub mod test_utils;

pub use backend::{DatabaseBackend, SecretLifecycle};
pub use config::BackendConfig;
pub use connection::{ConnectionHandle, ConnectionRegistry, ConnectionState};
pub use context::RequestContext;
pub use error::{Error, ErrorKind, Result};
pub use lease::{LeaseRequest, LeaseResponse};
pub use role::{Role, RoleResolver, Statements};
