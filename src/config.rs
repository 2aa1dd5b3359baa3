use crate::{role::Role, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lease TTLs applied when a role leaves its own at zero.
pub const DEFAULT_SYSTEM_TTL: Duration = Duration::from_secs(768 * 3600);

pub const ENV_DEFAULT_TTL: &str = "DBCREDS_DEFAULT_TTL";
pub const ENV_MAX_TTL: &str = "DBCREDS_MAX_TTL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    #[serde(with = "humantime_serde")]
    pub system_default_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub system_max_ttl: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            system_default_ttl: DEFAULT_SYSTEM_TTL,
            system_max_ttl: DEFAULT_SYSTEM_TTL,
        }
    }
}

impl BackendConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Defaults overridden by `DBCREDS_DEFAULT_TTL` / `DBCREDS_MAX_TTL`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_DEFAULT_TTL) {
            self.system_default_ttl = parse_ttl(ENV_DEFAULT_TTL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_TTL) {
            self.system_max_ttl = parse_ttl(ENV_MAX_TTL, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.system_max_ttl.is_zero() && self.system_default_ttl > self.system_max_ttl {
            return Err(Error::Config(format!(
                "system_default_ttl ({}) exceeds system_max_ttl ({})",
                humantime::format_duration(self.system_default_ttl),
                humantime::format_duration(self.system_max_ttl),
            )));
        }
        Ok(())
    }

    /// Default and max TTL in force for `role`: its own values, falling back
    /// to the system ones, with the system max as a hard ceiling.
    pub fn effective_ttls(&self, role: &Role) -> (Duration, Duration) {
        let default_ttl = if role.default_ttl.is_zero() {
            self.system_default_ttl
        } else {
            role.default_ttl
        };

        let mut max_ttl = if role.max_ttl.is_zero() {
            self.system_max_ttl
        } else {
            role.max_ttl
        };
        if !self.system_max_ttl.is_zero() && max_ttl > self.system_max_ttl {
            max_ttl = self.system_max_ttl;
        }

        (default_ttl, max_ttl)
    }
}

fn parse_ttl(key: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim()).map_err(|e| Error::Config(format!("{key}: {e}")))
}
