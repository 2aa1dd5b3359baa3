//! Role policy and its resolution from storage.
//!
//! Roles are edited by administrators while credentials issued under them
//! are still live, so [`RoleResolver`] never caches: every renewal and
//! revocation sees the policy as it is stored right now.

use crate::{
    storage::{self, Storage},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ROLE_PREFIX: &str = "role/";

/// Used when a role defines no renew statements.
pub const DEFAULT_RENEW_STATEMENT: &str = r#"ALTER ROLE "{{name}}" VALID UNTIL '{{expiration}}';"#;

/// Used when a role defines no revocation statements. Tolerates an account
/// that is already gone.
pub const DEFAULT_REVOKE_STATEMENT: &str = r#"DROP ROLE IF EXISTS "{{name}}";"#;

/// Statement templates attached to a role. Rendering the `{{name}}` and
/// `{{expiration}}` placeholders is left to the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statements {
    pub creation: Vec<String>,
    pub revocation: Vec<String>,
    pub rollback: Vec<String>,
    pub renewal: Vec<String>,
}

impl Statements {
    pub fn renewal_or_default(&self) -> Vec<&str> {
        Self::or_default(&self.renewal, DEFAULT_RENEW_STATEMENT)
    }

    pub fn revocation_or_default(&self) -> Vec<&str> {
        Self::or_default(&self.revocation, DEFAULT_REVOKE_STATEMENT)
    }

    fn or_default<'a>(stmts: &'a [String], default: &'static str) -> Vec<&'a str> {
        let stmts: Vec<&str> = stmts
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if stmts.is_empty() {
            vec![default]
        } else {
            stmts
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub db_name: String,
    #[serde(default, with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default, with = "humantime_serde")]
    pub max_ttl: Duration,
    #[serde(default)]
    pub statements: Statements,
}

impl Role {
    pub fn new(db_name: impl Into<String>, default_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            db_name: db_name.into(),
            default_ttl,
            max_ttl,
            statements: Statements::default(),
        }
    }

    pub fn with_statements(mut self, statements: Statements) -> Self {
        self.statements = statements;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RoleResolver {
    storage: Arc<dyn Storage>,
}

impl RoleResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Read the role fresh from storage.
    pub async fn resolve(&self, name: &str) -> Result<Role> {
        let role: Option<Role> = storage::get_json(self.storage.as_ref(), &role_key(name))
            .await
            .map_err(|e| Error::Resolution(format!("failed to load role {name:?}: {e}")))?;

        match role {
            Some(role) => {
                debug!(role = name, db = %role.db_name, "resolved role");
                Ok(role)
            }
            None => Err(Error::RoleNotFound {
                role: name.to_string(),
            }),
        }
    }

    pub async fn put(&self, name: &str, role: &Role) -> Result<()> {
        storage::put_json(self.storage.as_ref(), &role_key(name), role).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.storage.delete(&role_key(name)).await
    }
}

fn role_key(name: &str) -> String {
    format!("{ROLE_PREFIX}{name}")
}
