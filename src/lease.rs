use crate::{time::Timestamp, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const USERNAME_KEY: &str = "username";
pub const ROLE_KEY: &str = "role";

/// Untyped data attached to a lease when the credential was issued.
pub type InternalData = Map<String, Value>;

/// A renew or revoke request as handed over by the lease scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub lease_id: String,
    /// Extension asked for by the caller. `None` (or zero) means "use the
    /// role default".
    #[serde(default, with = "humantime_serde")]
    pub increment: Option<Duration>,
    #[serde(default)]
    pub internal_data: InternalData,
}

impl LeaseRequest {
    pub fn new(lease_id: impl Into<String>, internal_data: InternalData) -> Self {
        Self {
            lease_id: lease_id.into(),
            increment: None,
            internal_data,
        }
    }

    pub fn with_increment(mut self, increment: Duration) -> Self {
        self.increment = Some(increment);
        self
    }

    /// Internal data for a credential issued as `username` under `role`.
    pub fn creds_data(username: &str, role: &str) -> InternalData {
        let mut data = Map::new();
        data.insert(USERNAME_KEY.to_string(), Value::String(username.to_string()));
        data.insert(ROLE_KEY.to_string(), Value::String(role.to_string()));
        data
    }
}

/// Typed view of the internal data every credential lease carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredsLease {
    pub username: String,
    pub role: String,
}

impl CredsLease {
    pub fn decode(data: &InternalData) -> Result<Self> {
        Ok(Self {
            username: required(data, USERNAME_KEY)?.to_string(),
            role: required(data, ROLE_KEY)?.to_string(),
        })
    }
}

fn required<'a>(data: &'a InternalData, key: &'static str) -> Result<&'a str> {
    match data.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        _ => Err(Error::MissingAttribute { key }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseExtension {
    pub ttl: Duration,
    /// `None` for a lease that never expires.
    pub expiration: Option<Timestamp>,
}

/// Compute the next lease window.
///
/// The requested increment (or `default_ttl` without one) is capped at
/// `max_ttl`; a zero `max_ttl` means uncapped. A zero result yields a
/// non-expiring lease.
pub fn extend(
    now: Timestamp,
    requested: Option<Duration>,
    default_ttl: Duration,
    max_ttl: Duration,
) -> Result<LeaseExtension> {
    let mut ttl = match requested {
        Some(r) if !r.is_zero() => r,
        _ => default_ttl,
    };
    if !max_ttl.is_zero() && ttl > max_ttl {
        ttl = max_ttl;
    }

    if ttl.is_zero() {
        return Ok(LeaseExtension {
            ttl,
            expiration: None,
        });
    }

    let delta = chrono::Duration::from_std(ttl).map_err(|_| Error::InvalidTtl(ttl))?;
    let expiration = now.checked_add_signed(delta).ok_or(Error::InvalidTtl(ttl))?;
    Ok(LeaseExtension {
        ttl,
        expiration: Some(expiration),
    })
}

/// Outcome of a successful renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub lease_id: String,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub expiration: Option<Timestamp>,
}
