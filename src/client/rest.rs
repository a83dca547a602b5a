//! HTTP client for the control-plane REST API
//!
//! One `RestClient` is one authenticated session. Non-success responses are
//! decoded from the `{"error": <status>, "message": ...}` envelope into
//! [`Error::Api`]; the classifier works from that status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::gateway::ObjectGateway;
use super::types::{
    Cluster, ClusterGateway, ConvertDisk, ExternalGuest, Guest, Host, HostNetwork,
    IscsiLogin, IscsiSession, IscsiTarget, NewDisk, Pool, Profile, Realm, StorageDisk,
    StoragePool, Task, Template, User,
};
use crate::config::ConnectionSpec;
use crate::error::{Error, Result};

/// Per-request timeout; long-running work is tracked through tasks instead
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

/// Authenticated session against one control plane
pub struct RestClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Log in to `https://{host}:{port}/api`
    pub async fn login(spec: &ConnectionSpec) -> Result<Self> {
        Self::login_at(&spec.base_url(), spec).await
    }

    /// Log in against an explicit API base URL
    pub async fn login_at(base_url: &str, spec: &ConnectionSpec) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::ConfigError(format!("invalid API url '{base_url}': {e}")))?;

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(spec.insecure)
            .user_agent(concat!("hive-reconciler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;

        let mut client = Self {
            http,
            base_url,
            token: String::new(),
        };

        debug!(
            "Authenticating to {} as {}@{}",
            client.base_url, spec.username, spec.realm
        );
        let body = json!({
            "username": spec.username,
            "password": spec.password,
            "realm": spec.realm,
        });
        let response = client
            .http
            .post(client.url(&["auth"])?)
            .json(&body)
            .send()
            .await?;
        let login: LoginResponse = decode(response).await?;
        client.token = login.token;
        Ok(client)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::ConfigError(format!("API url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let url = self.url(segments)?;
        debug!("{} {}", method, url);
        let builder = self.http.request(method, url);
        Ok(if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        })
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        decode(self.request(Method::GET, segments)?.send().await?).await
    }

    async fn get_query<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T> {
        decode(
            self.request(Method::GET, segments)?
                .query(query)
                .send()
                .await?,
        )
        .await
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<()> {
        expect_success(self.request(method, segments)?.json(body).send().await?).await
    }

    async fn submit<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> Result<Task> {
        decode(
            self.request(Method::POST, segments)?
                .json(body)
                .send()
                .await?,
        )
        .await
    }

    async fn remove(&self, segments: &[&str]) -> Result<()> {
        expect_success(self.request(Method::DELETE, segments)?.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(decode_error_envelope(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| {
        warn!("Malformed response body ({} bytes): {}", body.len(), e);
        Error::SerializationError(e)
    })
}

async fn expect_success(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(decode_error_envelope(status.as_u16(), &body))
}

/// Turn a non-success response into [`Error::Api`]
///
/// The status embedded in the envelope wins over the HTTP status line. The
/// message is kept verbatim; a nested `{"code", "message"}` object is
/// flattened to its inner message.
pub fn decode_error_envelope(http_status: u16, body: &str) -> Error {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let envelope = parsed.as_ref().and_then(Value::as_object);

    let status = envelope
        .and_then(|e| e.get("error"))
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(http_status);

    let message = match envelope.and_then(|e| e.get("message")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(inner)) => match inner.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => Value::Object(inner.clone()).to_string(),
        },
        Some(other) => other.to_string(),
        None if body.trim().is_empty() => format!("HTTP {http_status}"),
        None => body.trim().to_string(),
    };

    Error::Api { status, message }
}

#[async_trait]
impl ObjectGateway for RestClient {
    async fn get_task(&self, id: &str) -> Result<Task> {
        self.get(&["task", id]).await
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        self.get(&["hosts"]).await
    }

    async fn get_host(&self, id: &str) -> Result<Host> {
        self.get(&["host", id]).await
    }

    async fn join_host(&self, username: &str, password: &str, address: &str) -> Result<Task> {
        let body = json!({
            "username": username,
            "password": password,
            "ipAddress": address,
        });
        self.submit(&["host", "join"], &body).await
    }

    async fn set_host_state(&self, id: &str, state: &str) -> Result<Task> {
        self.submit(&["host", id, "state"], &json!({ "state": state }))
            .await
    }

    async fn set_gateway_mode(&self, id: &str, enabled: bool) -> Result<()> {
        self.send(
            Method::POST,
            &["host", id, "gatewayMode"],
            &json!({ "enabled": enabled }),
        )
        .await
    }

    async fn update_appliance(&self, id: &str, host: &Host) -> Result<()> {
        self.send(Method::PUT, &["host", id, "appliance"], &host.appliance)
            .await
    }

    async fn unjoin_host(&self, id: &str) -> Result<Task> {
        self.submit(&["host", id, "unjoin"], &json!({})).await
    }

    async fn delete_host(&self, id: &str) -> Result<()> {
        self.remove(&["host", id]).await
    }

    async fn get_host_network(&self, host_id: &str, name: &str) -> Result<HostNetwork> {
        self.get(&["host", host_id, "network", name]).await
    }

    async fn set_host_network(&self, host_id: &str, network: &HostNetwork) -> Result<()> {
        self.send(
            Method::PUT,
            &["host", host_id, "network", &network.name],
            network,
        )
        .await
    }

    async fn delete_host_network(&self, host_id: &str, name: &str) -> Result<()> {
        self.remove(&["host", host_id, "network", name]).await
    }

    async fn iscsi_discover(&self, host_id: &str, portal: &str) -> Result<Vec<IscsiTarget>> {
        decode(
            self.request(Method::POST, &["host", host_id, "iscsi", "discover"])?
                .json(&json!({ "portal": portal }))
                .send()
                .await?,
        )
        .await
    }

    async fn iscsi_sessions(
        &self,
        host_id: &str,
        portal: &str,
        target: &str,
    ) -> Result<Vec<IscsiSession>> {
        self.get_query(
            &["host", host_id, "iscsi", "sessions"],
            &[("portal", portal), ("target", target)],
        )
        .await
    }

    async fn iscsi_login(&self, host_id: &str, login: &IscsiLogin) -> Result<Vec<IscsiSession>> {
        decode(
            self.request(Method::POST, &["host", host_id, "iscsi", "login"])?
                .json(login)
                .send()
                .await?,
        )
        .await
    }

    async fn iscsi_logout(&self, host_id: &str, portal: &str, target: &str) -> Result<()> {
        self.send(
            Method::POST,
            &["host", host_id, "iscsi", "logout"],
            &json!({ "portal": portal, "target": target }),
        )
        .await
    }

    async fn list_storage_pools(&self) -> Result<Vec<StoragePool>> {
        self.get(&["storage", "pools"]).await
    }

    async fn get_storage_pool(&self, id: &str) -> Result<StoragePool> {
        self.get(&["storage", "pool", id]).await
    }

    async fn create_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        self.send(Method::POST, &["storage", "pools"], pool).await
    }

    async fn update_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        self.send(Method::PUT, &["storage", "pool", &pool.id], pool)
            .await
    }

    async fn delete_storage_pool(&self, id: &str) -> Result<()> {
        self.remove(&["storage", "pool", id]).await
    }

    async fn disk_info(&self, storage_id: &str, filename: &str) -> Result<StorageDisk> {
        self.get_query(
            &["storage", "pool", storage_id, "diskInfo"],
            &[("filename", filename)],
        )
        .await
    }

    async fn create_disk(&self, storage_id: &str, disk: &NewDisk) -> Result<Task> {
        self.submit(&["storage", "pool", storage_id, "createDisk"], disk)
            .await
    }

    async fn copy_url(&self, storage_id: &str, url: &str, filename: &str) -> Result<Task> {
        let body = json!({ "url": url, "filename": filename });
        self.submit(&["storage", "pool", storage_id, "copyUrl"], &body)
            .await
    }

    async fn convert_disk(&self, src_storage_id: &str, request: &ConvertDisk) -> Result<Task> {
        self.submit(&["storage", "pool", src_storage_id, "convert"], request)
            .await
    }

    async fn grow_disk(&self, storage_id: &str, filename: &str, gigabytes: u64) -> Result<Task> {
        let body = json!({ "filename": filename, "size": gigabytes });
        self.submit(&["storage", "pool", storage_id, "grow"], &body)
            .await
    }

    async fn delete_file(&self, storage_id: &str, filename: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &["storage", "pool", storage_id, "file"])?
            .query(&[("filename", filename)])
            .send()
            .await?;
        expect_success(response).await
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        self.get(&["pools"]).await
    }

    async fn get_pool(&self, id: &str) -> Result<Pool> {
        self.get(&["pool", id]).await
    }

    async fn create_pool(&self, pool: &Pool) -> Result<()> {
        self.send(Method::POST, &["pools"], pool).await
    }

    async fn update_pool(&self, pool: &Pool) -> Result<()> {
        self.send(Method::PUT, &["pool", &pool.id], pool).await
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        self.remove(&["pool", id]).await
    }

    async fn get_guest(&self, name: &str) -> Result<Guest> {
        self.get(&["guest", name]).await
    }

    async fn create_external_guest(&self, guest: &ExternalGuest) -> Result<()> {
        self.send(Method::POST, &["guests", "external"], guest).await
    }

    async fn delete_guest(&self, name: &str) -> Result<()> {
        self.remove(&["guest", name]).await
    }

    async fn get_template(&self, name: &str) -> Result<Template> {
        self.get(&["template", name]).await
    }

    async fn create_template(&self, template: &Template) -> Result<()> {
        self.send(Method::POST, &["templates"], template).await
    }

    async fn update_template(&self, template: &Template) -> Result<()> {
        self.send(Method::PUT, &["template", &template.name], template)
            .await
    }

    async fn delete_template(&self, name: &str) -> Result<()> {
        self.remove(&["template", name]).await
    }

    async fn get_realm(&self, name: &str) -> Result<Realm> {
        self.get(&["realm", name]).await
    }

    async fn create_realm(&self, realm: &Realm) -> Result<()> {
        self.send(Method::POST, &["realms"], realm).await
    }

    async fn update_realm(&self, realm: &Realm) -> Result<()> {
        self.send(Method::PUT, &["realm", &realm.name], realm).await
    }

    async fn delete_realm(&self, name: &str) -> Result<()> {
        self.remove(&["realm", name]).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.get(&["users"]).await
    }

    async fn get_user(&self, id: &str) -> Result<User> {
        self.get(&["user", id]).await
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        self.send(Method::POST, &["users"], user).await
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        self.send(Method::PUT, &["user", &user.id], user).await
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        self.remove(&["user", id]).await
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.get(&["profiles"]).await
    }

    async fn get_profile(&self, id: &str) -> Result<Profile> {
        self.get(&["profile", id]).await
    }

    async fn create_profile(&self, profile: &Profile) -> Result<()> {
        self.send(Method::POST, &["profiles"], profile).await
    }

    async fn update_profile(&self, profile: &Profile) -> Result<()> {
        self.send(Method::PUT, &["profile", &profile.id], profile)
            .await
    }

    async fn delete_profile(&self, id: &str) -> Result<()> {
        self.remove(&["profile", id]).await
    }

    async fn cluster_id(&self) -> Result<String> {
        let clusters: Vec<Cluster> = self.get(&["clusters"]).await?;
        clusters
            .into_iter()
            .map(|c| c.id)
            .find(|id| !id.is_empty())
            .ok_or_else(|| Error::unexpected("control plane reported no cluster"))
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        self.get(&["cluster", id]).await
    }

    async fn set_license(&self, cluster_id: &str, license: &str) -> Result<()> {
        self.send(
            Method::POST,
            &["cluster", cluster_id, "license"],
            &json!({ "license": license }),
        )
        .await
    }

    async fn get_gateway(&self, cluster_id: &str) -> Result<ClusterGateway> {
        self.get(&["cluster", cluster_id, "gateway"]).await
    }

    async fn set_gateway(&self, cluster_id: &str, gateway: &ClusterGateway) -> Result<()> {
        self.send(Method::PUT, &["cluster", cluster_id, "gateway"], gateway)
            .await
    }

    async fn enable_shared_storage(
        &self,
        cluster_id: &str,
        utilization: u32,
        set_size: u32,
    ) -> Result<Task> {
        let body = json!({ "utilization": utilization, "minSetSize": set_size });
        self.submit(&["cluster", cluster_id, "sharedStorage", "enable"], &body)
            .await
    }

    async fn disable_shared_storage(&self, cluster_id: &str) -> Result<Task> {
        self.submit(&["cluster", cluster_id, "sharedStorage", "disable"], &json!({}))
            .await
    }
}
