//! Connection and engine configuration
//!
//! Connection settings mirror the control-plane login (host, port, identity,
//! realm, TLS verification) and can be read from `HIO_*` environment
//! variables. Engine settings (timeouts, polling, settle waits, retry backoff)
//! are loaded from TOML; every field has a default so an empty document is valid.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::{PollPolicy, RetryPolicy, SettlePolicy};
use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_REALM: &str = "local";

/// Parameters for one authenticated control-plane session
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Hostname or ip address of the control plane
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    pub password: String,

    #[serde(default = "default_realm")]
    pub realm: String,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_realm() -> String {
    DEFAULT_REALM.to_string()
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("realm", &self.realm)
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl ConnectionSpec {
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: password.into(),
            realm: DEFAULT_REALM.to_string(),
            insecure: false,
        }
    }

    /// Build from `HIO_HOST`, `HIO_PORT`, `HIO_USER`, `HIO_PASS`, `HIO_REALM`, `HIO_INSECURE`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = lookup("HIO_HOST")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ConfigError("HIO_HOST is not set".to_string()))?;
        let password = lookup("HIO_PASS")
            .ok_or_else(|| Error::ConfigError("HIO_PASS is not set".to_string()))?;

        let port = match lookup("HIO_PORT") {
            Some(p) => p
                .parse()
                .map_err(|e| Error::ConfigError(format!("invalid HIO_PORT '{p}': {e}")))?,
            None => DEFAULT_PORT,
        };
        let insecure = match lookup("HIO_INSECURE") {
            Some(v) => parse_bool(&v)
                .ok_or_else(|| Error::ConfigError(format!("invalid HIO_INSECURE '{v}'")))?,
            None => false,
        };

        Ok(Self {
            host,
            port,
            username: lookup("HIO_USER").unwrap_or_else(default_username),
            password,
            realm: lookup("HIO_REALM").unwrap_or_else(default_realm),
            insecure,
        })
    }

    /// Base URL of the REST API for this connection
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/api", self.host, self.port)
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Per-operation-category time budgets
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    #[serde(rename = "create_secs", with = "duration_secs")]
    pub create: Duration,
    #[serde(rename = "update_secs", with = "duration_secs")]
    pub update: Duration,
    #[serde(rename = "delete_secs", with = "duration_secs")]
    pub delete: Duration,
    #[serde(rename = "read_secs", with = "duration_secs")]
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(20 * 60),
            update: Duration::from_secs(20 * 60),
            delete: Duration::from_secs(3 * 60),
            read: Duration::from_secs(60),
        }
    }
}

/// Everything the engine needs besides a gateway
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub timeouts: Timeouts,
    pub poll: PollPolicy,
    pub settle: SettlePolicy,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::ConfigError(format!("invalid engine config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Serialize a `Duration` as whole seconds
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
