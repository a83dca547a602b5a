//! Remote object model of the control-plane REST API
//!
//! Every struct defaults missing fields so partially populated responses
//! (older firmware, optional sub-documents) still decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an asynchronous remote task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    #[serde(alias = "init", alias = "queued")]
    Pending,
    Running,
    Completed,
    Failed,
    /// Any state string this client does not know; treated as still in flight
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Objects a task created or operated on
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

/// Handle to an operation executing asynchronously on the control plane
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub message: String,
    #[serde(rename = "ref")]
    pub reference: TaskRef,
}

impl Task {
    /// Id of the first object the task references
    pub fn created_id(&self) -> Option<&str> {
        [
            &self.reference.host,
            &self.reference.storage,
            &self.reference.pool,
            &self.reference.guest,
            &self.reference.cluster,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .find(|id| !id.is_empty())
    }
}

// ── hosts ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Appliance {
    pub cluster_id: String,
    pub role: String,
    #[serde(rename = "loglevel")]
    pub log_level: String,
    pub max_clone_density: u32,
    pub ntp: String,
    pub timezone: String,
}

impl Appliance {
    pub fn is_gateway(&self) -> bool {
        self.role == "gateway"
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub hostid: String,
    pub hostname: String,
    #[serde(rename = "ip")]
    pub ip_address: String,
    pub state: String,
    pub appliance: Appliance,
}

impl Host {
    /// Whether `address` names this host by ip or hostname
    pub fn matches_address(&self, address: &str) -> bool {
        !address.is_empty() && (self.ip_address == address || self.hostname == address)
    }
}

/// A named network on one host's appliance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostNetwork {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub interface: String,
    pub vlan: u32,
    pub dhcp: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mask: String,
}

/// One target returned by iSCSI discovery against a portal
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IscsiTarget {
    pub portal: String,
    pub target: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlockDevice {
    pub name: String,
    pub path: String,
}

/// An active iSCSI login on a host
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IscsiSession {
    pub portal: String,
    pub target: String,
    pub block_device: BlockDevice,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiLogin {
    pub portal: String,
    pub target: String,
    /// `CHAP` or `None`
    pub auth_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

// ── storage ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoragePool {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub mount_options: Vec<String>,
    pub roles: Vec<String>,
    pub tags: Vec<String>,
    pub hosts: Vec<String>,
    #[serde(rename = "s3AccessKeyId", skip_serializing_if = "String::is_empty")]
    pub s3_access_key_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub s3_secret_access_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub s3_region: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(rename = "fsName", skip_serializing_if = "String::is_empty")]
    pub fs_name: String,
    pub create_filesystem: bool,
    pub clear_disk: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
}

/// File metadata inside a storage pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageDisk {
    pub storage_id: String,
    pub filename: String,
    pub format: String,
    pub virtual_size: u64,
    pub actual_size: u64,
}

/// Body of a blank-disk create request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDisk {
    pub filename: String,
    pub format: String,
    /// Size in GiB
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<StorageDisk>,
}

/// Body of a convert (copy between pools) request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertDisk {
    pub src_filename: String,
    pub dest_storage_id: String,
    pub dest_filename: String,
    pub format: String,
}

// ── pools and guests ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudInit {
    pub enabled: bool,
    pub user_data: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network_config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Backup {
    pub enabled: bool,
    pub frequency: String,
    pub target_storage_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolAffinity {
    pub allowed_host_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerGateway {
    pub disabled: bool,
    pub persistent: bool,
    pub protocols: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConnection {
    pub name: String,
    pub description: String,
    pub port: u16,
    pub protocol: String,
    pub disable_html5: bool,
    pub gateway: BrokerGateway,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerOptions {
    pub default_connection: String,
    pub connections: Vec<BrokerConnection>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolDisk {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub storage_id: String,
    pub filename: String,
    pub disk_driver: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInterface {
    pub network: String,
    pub vlan: u32,
    pub emulation: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuestProfile {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub template_name: String,
    pub os: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub firmware: String,
    pub vga: String,
    pub gpu: bool,
    pub persistent: bool,
    /// `[min, max]` vCPUs
    pub cpu: Vec<u32>,
    /// `[min, max]` memory in MB
    pub mem: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,
    pub disks: Vec<PoolDisk>,
    pub interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_options: Option<BrokerOptions>,
}

/// A guest pool; standalone virtual machines are pools of type `standalone`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Pool {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    /// `[min, max]` guests
    pub density: Vec<u32>,
    pub inject_agent: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub seed: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub profile_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_profile: Option<GuestProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<Backup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_affinity: Option<PoolAffinity>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuestInterface {
    pub network: String,
    pub vlan: u32,
    pub emulation: String,
    pub ip_address: String,
    pub mac_address: String,
}

/// Runtime record of a guest built from a pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Guest {
    pub name: String,
    pub state: String,
    pub target_state: String,
    pub ready: bool,
    pub interfaces: Vec<GuestInterface>,
    // set for externally registered guests
    pub address: String,
    pub username: String,
    #[serde(rename = "ADGroup")]
    pub ad_group: String,
    pub profile_id: String,
    pub realm: String,
    pub os: String,
    pub disable_port_check: bool,
    pub broker_options: Option<BrokerOptions>,
}

impl Guest {
    pub fn at_target_state(&self) -> bool {
        !self.state.is_empty() && self.state == self.target_state
    }

    pub fn has_ip_address(&self) -> bool {
        self.interfaces.iter().any(|i| !i.ip_address.is_empty())
    }
}

/// Registration body for a guest that runs outside the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalGuest {
    pub guest_name: String,
    pub address: String,
    pub username: String,
    #[serde(rename = "ADGroup", skip_serializing_if = "String::is_empty")]
    pub ad_group: String,
    pub profile_id: String,
    pub realm: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub os: String,
    pub disable_port_check: bool,
    pub broker_options: BrokerOptions,
}

// ── templates ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateDisk {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub storage_id: String,
    pub filename: String,
    pub disk_driver: String,
    pub format: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub vcpu: u32,
    pub mem: u32,
    pub firmware: String,
    pub display_driver: String,
    pub os: String,
    pub manual_agent_install: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state_message: String,
    pub disks: Vec<TemplateDisk>,
    pub interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_options: Option<BrokerOptions>,
}

// ── realms, users, profiles ────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAccount {
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Realm {
    pub name: String,
    #[serde(rename = "fqdn")]
    pub fqdn: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub site: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alias: String,
    pub verified: bool,
    #[serde(rename = "forceTls")]
    pub force_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccount>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group_name: String,
    pub realm: String,
    pub role: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdConfig {
    pub domain: String,
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub user_group: String,
    pub ou: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Profile {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_config: Option<AdConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<Backup>,
}

// ── cluster-level documents ────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct License {
    #[serde(rename = "type")]
    pub license_type: String,
    pub expiration: String,
    pub max_guests: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SharedStorageInfo {
    pub id: String,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub license: Option<License>,
    pub shared_storage: Option<SharedStorageInfo>,
}

impl Cluster {
    /// Id of the shared storage pool, when shared storage is on
    pub fn shared_storage_id(&self) -> Option<&str> {
        self.shared_storage
            .as_ref()
            .map(|s| s.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayHost {
    pub start_port: u16,
    pub end_port: u16,
    pub external_address: String,
}

/// Cluster-wide broker gateway document; per-host entries keyed by host id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterGateway {
    pub enabled: bool,
    pub client_source_isolation: bool,
    pub hosts: BTreeMap<String, GatewayHost>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_decodes_ref_and_state() {
        let task: Task = serde_json::from_str(
            r#"{"id":"t-1","name":"joinHost","state":"completed","message":"","ref":{"host":"host-123"}}"#,
        )
        .unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.created_id(), Some("host-123"));
    }

    #[test]
    fn test_task_unknown_state_is_not_terminal() {
        let task: Task = serde_json::from_str(r#"{"id":"t-2","state":"paused"}"#).unwrap();
        assert_eq!(task.state, TaskState::Unknown);
        assert!(!task.state.is_terminal());

        let task: Task = serde_json::from_str(r#"{"id":"t-3","state":"init"}"#).unwrap();
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn test_task_without_ref_has_no_created_id() {
        let task: Task = serde_json::from_str(r#"{"id":"t-4","state":"running"}"#).unwrap();
        assert_eq!(task.created_id(), None);
    }

    #[test]
    fn test_host_decodes_appliance() {
        let host: Host = serde_json::from_str(
            r#"{"hostid":"h1","hostname":"hive1","ip":"10.0.0.5","state":"available",
                "appliance":{"clusterId":"c1","role":"gateway","loglevel":"info","maxCloneDensity":4}}"#,
        )
        .unwrap();
        assert!(host.appliance.is_gateway());
        assert_eq!(host.appliance.max_clone_density, 4);
        assert!(host.matches_address("10.0.0.5"));
        assert!(host.matches_address("hive1"));
        assert!(!host.matches_address(""));
    }

    #[test]
    fn test_pool_tolerates_missing_sub_documents() {
        let pool: Pool = serde_json::from_str(r#"{"id":"p1","name":"desk"}"#).unwrap();
        assert!(pool.guest_profile.is_none());
        assert!(pool.backup.is_none());
        assert!(pool.pool_affinity.is_none());
    }

    #[test]
    fn test_storage_pool_omits_empty_secrets() {
        let pool = StoragePool {
            name: "nfs1".to_string(),
            pool_type: "nfs".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&pool).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("id").is_none());
        assert_eq!(json["type"], "nfs");
    }
}
