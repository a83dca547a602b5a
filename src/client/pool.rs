//! Shared authenticated sessions, one per distinct connection
//!
//! Sessions are keyed by every field that changes who is talking to whom:
//! host, port, username, realm and TLS verification. Authentication happens
//! outside the map lock, so two first-time callers for the same key may both
//! log in; the later insert replaces the earlier one and both sessions remain
//! valid for their holders.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::gateway::ObjectGateway;
use super::rest::RestClient;
use crate::config::ConnectionSpec;
use crate::error::{Error, Result};

/// Identity of a session in the pool
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub realm: String,
    pub insecure: bool,
}

impl From<&ConnectionSpec> for ConnectionKey {
    fn from(spec: &ConnectionSpec) -> Self {
        Self {
            host: spec.host.clone(),
            port: spec.port,
            username: spec.username.clone(),
            realm: spec.realm.clone(),
            insecure: spec.insecure,
        }
    }
}

/// Opens a new authenticated session
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Arc<dyn ObjectGateway>>;
}

/// Logs in over HTTPS with [`RestClient`]
#[derive(Clone, Copy, Debug, Default)]
pub struct RestConnector;

#[async_trait]
impl Connector for RestConnector {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Arc<dyn ObjectGateway>> {
        let client = RestClient::login(spec).await?;
        Ok(Arc::new(client))
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    sessions: RwLock<HashMap<ConnectionKey, Arc<dyn ObjectGateway>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(RestConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached session for `spec`, logging in on first use
    pub async fn get(&self, spec: &ConnectionSpec) -> Result<Arc<dyn ObjectGateway>> {
        let key = ConnectionKey::from(spec);

        if let Some(session) = self.sessions.read().await.get(&key) {
            debug!("Reusing session for {}@{}:{}", key.username, key.host, key.port);
            return Ok(Arc::clone(session));
        }

        let session = self.connector.connect(spec).await.map_err(|e| {
            warn!("Authentication to {} failed: {}", spec.host, e);
            Error::Authentication {
                host: spec.host.clone(),
                source: Box::new(e),
            }
        })?;

        info!(
            "Opened session to {}:{} as {}@{}",
            key.host, key.port, key.username, key.realm
        );
        self.sessions
            .write()
            .await
            .insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Drop the cached session for `spec`; the next `get` logs in again
    pub async fn evict(&self, spec: &ConnectionSpec) -> bool {
        self.sessions
            .write()
            .await
            .remove(&ConnectionKey::from(spec))
            .is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
