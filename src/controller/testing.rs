//! In-memory control plane for engine tests
//!
//! [`FakeGateway`] keeps every remote object in maps behind a mutex and
//! records the name of each gateway call. Submitted tasks complete
//! immediately unless a script says otherwise, and any call can be made to
//! fail a number of times with a given status.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::types::{
    BlockDevice, Cluster, ClusterGateway, ConvertDisk, ExternalGuest, GatewayHost, Guest, Host,
    HostNetwork, IscsiLogin, IscsiSession, IscsiTarget, License, NewDisk, Pool, Profile, Realm,
    SharedStorageInfo, StorageDisk, StoragePool, Task, TaskRef, TaskState, Template, User,
};
use crate::client::ObjectGateway;
use crate::config::{EngineConfig, Timeouts};
use crate::controller::context::ReconcileContext;
use crate::controller::{PollPolicy, RetryPolicy, SettlePolicy};
use crate::error::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Engine settings with millisecond waits and no settle delays
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        timeouts: Timeouts {
            create: Duration::from_secs(5),
            update: Duration::from_secs(5),
            delete: Duration::from_secs(5),
            read: Duration::from_secs(5),
        },
        poll: PollPolicy {
            interval: Duration::from_millis(2),
        },
        settle: SettlePolicy::none(),
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        },
    }
}

pub fn context_with(gateway: Arc<FakeGateway>, budget: Duration) -> ReconcileContext {
    ReconcileContext::new(
        gateway,
        Arc::new(fast_config()),
        CancellationToken::new(),
        "test",
        budget,
    )
}

pub fn task(id: &str, state: TaskState) -> Task {
    Task {
        id: id.to_string(),
        name: "test".to_string(),
        state,
        ..Default::default()
    }
}

fn not_found(what: &str, id: &str) -> Error {
    Error::Api {
        status: 404,
        message: format!("{what} {id} not found"),
    }
}

struct Failure {
    /// `None` fails at the transport level
    status: Option<u16>,
    message: String,
    remaining: u32,
}

struct ScriptedTask {
    states: VecDeque<TaskState>,
    message: String,
    reference: TaskRef,
}

#[derive(Default)]
struct State {
    calls: Vec<String>,
    failures: HashMap<String, Failure>,
    tasks: HashMap<String, ScriptedTask>,
    submit_scripts: HashMap<String, Vec<TaskState>>,
    next_ids: VecDeque<String>,
    counter: u32,
    drop_creates: bool,
    linger_reads: u32,
    lingering: HashMap<String, u32>,

    hosts: BTreeMap<String, Host>,
    host_networks: BTreeMap<(String, String), HostNetwork>,
    iscsi_portals: HashMap<String, Vec<IscsiTarget>>,
    iscsi_sessions: BTreeMap<String, Vec<IscsiSession>>,
    /// Credentials of each login, by host
    iscsi_logins: Vec<(String, IscsiLogin)>,
    storage_pools: BTreeMap<String, StoragePool>,
    disks: BTreeMap<(String, String), StorageDisk>,
    pools: BTreeMap<String, Pool>,
    guests: BTreeMap<String, Guest>,
    templates: BTreeMap<String, Template>,
    realms: BTreeMap<String, Realm>,
    users: BTreeMap<String, User>,
    profiles: BTreeMap<String, Profile>,
    cluster: Option<Cluster>,
    gateway: ClusterGateway,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        match self.next_ids.pop_front() {
            Some(id) => id,
            None => format!("{prefix}-{}", self.counter),
        }
    }

    /// A task for `op`: completed, or pending with a scripted future
    fn submit(&mut self, op: &str, reference: TaskRef) -> Task {
        self.counter += 1;
        let id = format!("task-{}", self.counter);
        let state = match self.submit_scripts.remove(op) {
            Some(states) => {
                self.tasks.insert(
                    id.clone(),
                    ScriptedTask {
                        states: states.into(),
                        message: String::new(),
                        reference: reference.clone(),
                    },
                );
                TaskState::Pending
            }
            None => TaskState::Completed,
        };
        Task {
            id,
            name: op.to_string(),
            state,
            message: String::new(),
            reference,
        }
    }
}

fn is_read(op: &str) -> bool {
    op.starts_with("get_")
        || op.starts_with("list_")
        || matches!(op, "disk_info" | "cluster_id" | "iscsi_discover" | "iscsi_sessions")
}

pub struct FakeGateway {
    state: Mutex<State>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateway {
    /// An empty control plane with one cluster, `c1`
    pub fn new() -> Self {
        let state = State {
            cluster: Some(Cluster {
                id: "c1".to_string(),
                name: "hive".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Record a call and apply any pending failure for it
    fn record(&self, op: &str) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(op.to_string());
        if let Some(failure) = state.failures.get_mut(op) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                return Err(match failure.status {
                    Some(status) => Error::Api {
                        status,
                        message: failure.message.clone(),
                    },
                    None => Error::Connection(failure.message.clone()),
                });
            }
        }
        Ok(state)
    }

    // ── test controls ──────────────────────────────────────────────────────

    pub fn fail(&self, op: &str, status: u16, message: &str, times: u32) {
        self.lock().failures.insert(
            op.to_string(),
            Failure {
                status: Some(status),
                message: message.to_string(),
                remaining: times,
            },
        );
    }

    pub fn fail_connection(&self, op: &str, times: u32) {
        self.lock().failures.insert(
            op.to_string(),
            Failure {
                status: None,
                message: "connection reset by peer".to_string(),
                remaining: times,
            },
        );
    }

    /// States returned by successive fetches of task `id`; the last one repeats
    pub fn script_task(&self, id: &str, states: &[TaskState]) {
        self.lock().tasks.insert(
            id.to_string(),
            ScriptedTask {
                states: states.iter().copied().collect(),
                message: String::new(),
                reference: TaskRef::default(),
            },
        );
    }

    pub fn set_task_message(&self, id: &str, message: &str) {
        if let Some(task) = self.lock().tasks.get_mut(id) {
            task.message = message.to_string();
        }
    }

    /// The next task submitted by `op` starts pending and then walks `states`
    pub fn script_submit(&self, op: &str, states: &[TaskState]) {
        self.lock()
            .submit_scripts
            .insert(op.to_string(), states.to_vec());
    }

    /// Id handed to the next created object
    pub fn push_id(&self, id: &str) {
        self.lock().next_ids.push_back(id.to_string());
    }

    /// Accept creates without storing anything
    pub fn drop_creates(&self) {
        self.lock().drop_creates = true;
    }

    /// Deleted pools stay readable in state `deleting` for `reads` more fetches
    pub fn linger_deletes(&self, reads: u32) {
        self.lock().linger_reads = reads;
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == op).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls that could have changed remote state
    pub fn mutations(&self) -> usize {
        self.lock().calls.iter().filter(|c| !is_read(c)).count()
    }

    pub fn add_host(&self, host: Host) {
        self.lock().hosts.insert(host.hostid.clone(), host);
    }

    pub fn host(&self, id: &str) -> Option<Host> {
        self.lock().hosts.get(id).cloned()
    }

    pub fn add_host_network(&self, host_id: &str, network: HostNetwork) {
        self.lock()
            .host_networks
            .insert((host_id.to_string(), network.name.clone()), network);
    }

    pub fn host_network(&self, host_id: &str, name: &str) -> Option<HostNetwork> {
        self.lock()
            .host_networks
            .get(&(host_id.to_string(), name.to_string()))
            .cloned()
    }

    /// Targets that discovery against `portal` reports
    pub fn add_iscsi_targets(&self, portal: &str, targets: Vec<IscsiTarget>) {
        self.lock().iscsi_portals.insert(portal.to_string(), targets);
    }

    pub fn add_iscsi_session(&self, host_id: &str, session: IscsiSession) {
        self.lock()
            .iscsi_sessions
            .entry(host_id.to_string())
            .or_default()
            .push(session);
    }

    pub fn iscsi_sessions_on(&self, host_id: &str) -> Vec<IscsiSession> {
        self.lock()
            .iscsi_sessions
            .get(host_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn iscsi_logins(&self) -> Vec<(String, IscsiLogin)> {
        self.lock().iscsi_logins.clone()
    }

    pub fn guest(&self, name: &str) -> Option<Guest> {
        self.lock().guests.get(name).cloned()
    }

    pub fn add_storage_pool(&self, pool: StoragePool) {
        self.lock().storage_pools.insert(pool.id.clone(), pool);
    }

    pub fn storage_pool(&self, id: &str) -> Option<StoragePool> {
        self.lock().storage_pools.get(id).cloned()
    }

    pub fn add_disk(&self, disk: StorageDisk) {
        self.lock()
            .disks
            .insert((disk.storage_id.clone(), disk.filename.clone()), disk);
    }

    pub fn disk(&self, storage_id: &str, filename: &str) -> Option<StorageDisk> {
        self.lock()
            .disks
            .get(&(storage_id.to_string(), filename.to_string()))
            .cloned()
    }

    pub fn add_pool(&self, pool: Pool) {
        self.lock().pools.insert(pool.id.clone(), pool);
    }

    pub fn pool(&self, id: &str) -> Option<Pool> {
        self.lock().pools.get(id).cloned()
    }

    pub fn add_guest(&self, guest: Guest) {
        self.lock().guests.insert(guest.name.clone(), guest);
    }

    pub fn add_template(&self, template: Template) {
        self.lock().templates.insert(template.name.clone(), template);
    }

    pub fn add_realm(&self, realm: Realm) {
        self.lock().realms.insert(realm.name.clone(), realm);
    }

    pub fn realm(&self, name: &str) -> Option<Realm> {
        self.lock().realms.get(name).cloned()
    }

    pub fn add_user(&self, user: User) {
        self.lock().users.insert(user.id.clone(), user);
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.lock().users.get(id).cloned()
    }

    pub fn add_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id.clone(), profile);
    }

    pub fn set_cluster(&self, cluster: Option<Cluster>) {
        self.lock().cluster = cluster;
    }

    pub fn cluster(&self) -> Option<Cluster> {
        self.lock().cluster.clone()
    }

    pub fn add_gateway_host(&self, host_id: &str, host: GatewayHost) {
        self.lock().gateway.hosts.insert(host_id.to_string(), host);
    }

    pub fn gateway_document(&self) -> ClusterGateway {
        self.lock().gateway.clone()
    }
}

#[async_trait]
impl ObjectGateway for FakeGateway {
    async fn get_task(&self, id: &str) -> Result<Task> {
        let mut state = self.record("get_task")?;
        let scripted = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| not_found("task", id))?;
        let current = if scripted.states.len() > 1 {
            scripted.states.pop_front()
        } else {
            scripted.states.front().copied()
        };
        Ok(Task {
            id: id.to_string(),
            name: "scripted".to_string(),
            state: current.unwrap_or(TaskState::Completed),
            message: scripted.message.clone(),
            reference: scripted.reference.clone(),
        })
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let state = self.record("list_hosts")?;
        Ok(state.hosts.values().cloned().collect())
    }

    async fn get_host(&self, id: &str) -> Result<Host> {
        let state = self.record("get_host")?;
        state.hosts.get(id).cloned().ok_or_else(|| not_found("host", id))
    }

    async fn join_host(&self, _username: &str, _password: &str, address: &str) -> Result<Task> {
        let mut state = self.record("join_host")?;
        let id = state.next_id("host");
        if !state.drop_creates {
            let host = Host {
                hostid: id.clone(),
                hostname: format!("hive-{id}"),
                ip_address: address.to_string(),
                state: "available".to_string(),
                appliance: crate::client::types::Appliance {
                    cluster_id: "c1".to_string(),
                    role: "hive".to_string(),
                    log_level: "info".to_string(),
                    max_clone_density: 8,
                    ntp: String::new(),
                    timezone: "UTC".to_string(),
                },
            };
            state.hosts.insert(id.clone(), host);
        }
        Ok(state.submit(
            "join_host",
            TaskRef {
                host: Some(id),
                ..Default::default()
            },
        ))
    }

    async fn set_host_state(&self, id: &str, host_state: &str) -> Result<Task> {
        let mut state = self.record("set_host_state")?;
        let host = state.hosts.get_mut(id).ok_or_else(|| not_found("host", id))?;
        host.state = host_state.to_string();
        Ok(state.submit(
            "set_host_state",
            TaskRef {
                host: Some(id.to_string()),
                ..Default::default()
            },
        ))
    }

    async fn set_gateway_mode(&self, id: &str, enabled: bool) -> Result<()> {
        let mut state = self.record("set_gateway_mode")?;
        let host = state.hosts.get_mut(id).ok_or_else(|| not_found("host", id))?;
        host.appliance.role = if enabled { "gateway" } else { "hive" }.to_string();
        Ok(())
    }

    async fn update_appliance(&self, id: &str, update: &Host) -> Result<()> {
        let mut state = self.record("update_appliance")?;
        let host = state.hosts.get_mut(id).ok_or_else(|| not_found("host", id))?;
        host.appliance = update.appliance.clone();
        Ok(())
    }

    async fn unjoin_host(&self, id: &str) -> Result<Task> {
        let mut state = self.record("unjoin_host")?;
        state.hosts.remove(id).ok_or_else(|| not_found("host", id))?;
        Ok(state.submit(
            "unjoin_host",
            TaskRef {
                host: Some(id.to_string()),
                ..Default::default()
            },
        ))
    }

    async fn delete_host(&self, id: &str) -> Result<()> {
        let mut state = self.record("delete_host")?;
        state
            .hosts
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("host", id))
    }

    async fn get_host_network(&self, host_id: &str, name: &str) -> Result<HostNetwork> {
        let state = self.record("get_host_network")?;
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }
        state
            .host_networks
            .get(&(host_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("network", name))
    }

    async fn set_host_network(&self, host_id: &str, network: &HostNetwork) -> Result<()> {
        let mut state = self.record("set_host_network")?;
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }
        state
            .host_networks
            .insert((host_id.to_string(), network.name.clone()), network.clone());
        Ok(())
    }

    async fn delete_host_network(&self, host_id: &str, name: &str) -> Result<()> {
        let mut state = self.record("delete_host_network")?;
        state
            .host_networks
            .remove(&(host_id.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("network", name))
    }

    async fn iscsi_discover(&self, host_id: &str, portal: &str) -> Result<Vec<IscsiTarget>> {
        let state = self.record("iscsi_discover")?;
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }
        Ok(state.iscsi_portals.get(portal).cloned().unwrap_or_default())
    }

    async fn iscsi_sessions(
        &self,
        host_id: &str,
        portal: &str,
        target: &str,
    ) -> Result<Vec<IscsiSession>> {
        let state = self.record("iscsi_sessions")?;
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }
        Ok(state
            .iscsi_sessions
            .get(host_id)
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|s| s.portal == portal && s.target == target)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn iscsi_login(&self, host_id: &str, login: &IscsiLogin) -> Result<Vec<IscsiSession>> {
        let mut state = self.record("iscsi_login")?;
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }
        state.iscsi_logins.push((host_id.to_string(), login.clone()));
        let known = state
            .iscsi_portals
            .values()
            .flatten()
            .any(|t| t.target == login.target);
        if !known {
            return Ok(Vec::new());
        }
        let sessions = state.iscsi_sessions.entry(host_id.to_string()).or_default();
        let device = format!("sd{}", (b'b' + sessions.len() as u8) as char);
        let session = IscsiSession {
            portal: login.portal.clone(),
            target: login.target.clone(),
            block_device: BlockDevice {
                path: format!("/dev/{device}"),
                name: device,
            },
        };
        sessions.push(session.clone());
        Ok(vec![session])
    }

    async fn iscsi_logout(&self, host_id: &str, portal: &str, target: &str) -> Result<()> {
        let mut state = self.record("iscsi_logout")?;
        let sessions = state
            .iscsi_sessions
            .get_mut(host_id)
            .ok_or_else(|| not_found("host", host_id))?;
        let before = sessions.len();
        sessions.retain(|s| !(s.portal == portal && s.target == target));
        if sessions.len() == before {
            return Err(not_found("session", target));
        }
        Ok(())
    }

    async fn list_storage_pools(&self) -> Result<Vec<StoragePool>> {
        let state = self.record("list_storage_pools")?;
        Ok(state.storage_pools.values().cloned().collect())
    }

    async fn get_storage_pool(&self, id: &str) -> Result<StoragePool> {
        let state = self.record("get_storage_pool")?;
        state
            .storage_pools
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("storage pool", id))
    }

    async fn create_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        let mut state = self.record("create_storage_pool")?;
        let id = state.next_id("sp");
        if !state.drop_creates {
            let mut stored = pool.clone();
            stored.id = id.clone();
            stored.state = "available".to_string();
            state.storage_pools.insert(id, stored);
        }
        Ok(())
    }

    async fn update_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        let mut state = self.record("update_storage_pool")?;
        let stored = state
            .storage_pools
            .get_mut(&pool.id)
            .ok_or_else(|| not_found("storage pool", &pool.id))?;
        let status = std::mem::take(&mut stored.state);
        *stored = pool.clone();
        stored.state = status;
        Ok(())
    }

    async fn delete_storage_pool(&self, id: &str) -> Result<()> {
        let mut state = self.record("delete_storage_pool")?;
        state
            .storage_pools
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("storage pool", id))
    }

    async fn disk_info(&self, storage_id: &str, filename: &str) -> Result<StorageDisk> {
        let state = self.record("disk_info")?;
        state
            .disks
            .get(&(storage_id.to_string(), filename.to_string()))
            .cloned()
            .ok_or_else(|| not_found("file", &format!("{storage_id}/{filename}")))
    }

    async fn create_disk(&self, storage_id: &str, disk: &NewDisk) -> Result<Task> {
        let mut state = self.record("create_disk")?;
        if !state.drop_creates {
            state.disks.insert(
                (storage_id.to_string(), disk.filename.clone()),
                StorageDisk {
                    storage_id: storage_id.to_string(),
                    filename: disk.filename.clone(),
                    format: disk.format.clone(),
                    virtual_size: disk.size * GIB,
                    actual_size: 0,
                },
            );
        }
        Ok(state.submit(
            "create_disk",
            TaskRef {
                storage: Some(storage_id.to_string()),
                ..Default::default()
            },
        ))
    }

    async fn copy_url(&self, storage_id: &str, _url: &str, filename: &str) -> Result<Task> {
        let mut state = self.record("copy_url")?;
        state.disks.insert(
            (storage_id.to_string(), filename.to_string()),
            StorageDisk {
                storage_id: storage_id.to_string(),
                filename: filename.to_string(),
                format: "qcow2".to_string(),
                virtual_size: 10 * GIB,
                actual_size: GIB,
            },
        );
        Ok(state.submit(
            "copy_url",
            TaskRef {
                storage: Some(storage_id.to_string()),
                ..Default::default()
            },
        ))
    }

    async fn convert_disk(&self, src_storage_id: &str, request: &ConvertDisk) -> Result<Task> {
        let mut state = self.record("convert_disk")?;
        let source = state
            .disks
            .get(&(src_storage_id.to_string(), request.src_filename.clone()))
            .cloned()
            .ok_or_else(|| not_found("file", &request.src_filename))?;
        state.disks.insert(
            (request.dest_storage_id.clone(), request.dest_filename.clone()),
            StorageDisk {
                storage_id: request.dest_storage_id.clone(),
                filename: request.dest_filename.clone(),
                format: request.format.clone(),
                ..source
            },
        );
        Ok(state.submit(
            "convert_disk",
            TaskRef {
                storage: Some(request.dest_storage_id.clone()),
                ..Default::default()
            },
        ))
    }

    async fn grow_disk(&self, storage_id: &str, filename: &str, gigabytes: u64) -> Result<Task> {
        let mut state = self.record("grow_disk")?;
        let disk = state
            .disks
            .get_mut(&(storage_id.to_string(), filename.to_string()))
            .ok_or_else(|| not_found("file", filename))?;
        disk.virtual_size += gigabytes * GIB;
        Ok(state.submit(
            "grow_disk",
            TaskRef {
                storage: Some(storage_id.to_string()),
                ..Default::default()
            },
        ))
    }

    async fn delete_file(&self, storage_id: &str, filename: &str) -> Result<()> {
        let mut state = self.record("delete_file")?;
        state
            .disks
            .remove(&(storage_id.to_string(), filename.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("file", filename))
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let state = self.record("list_pools")?;
        Ok(state.pools.values().cloned().collect())
    }

    async fn get_pool(&self, id: &str) -> Result<Pool> {
        let mut state = self.record("get_pool")?;
        if let Some(left) = state.lingering.get_mut(id) {
            if *left == 0 {
                state.lingering.remove(id);
                state.pools.remove(id);
            } else {
                *left -= 1;
            }
        }
        state.pools.get(id).cloned().ok_or_else(|| not_found("pool", id))
    }

    async fn create_pool(&self, pool: &Pool) -> Result<()> {
        let mut state = self.record("create_pool")?;
        let id = state.next_id("pool");
        if !state.drop_creates {
            let mut stored = pool.clone();
            stored.id = id.clone();
            stored.state = "tracking".to_string();
            state.pools.insert(id, stored);
        }
        Ok(())
    }

    async fn update_pool(&self, pool: &Pool) -> Result<()> {
        let mut state = self.record("update_pool")?;
        let stored = state
            .pools
            .get_mut(&pool.id)
            .ok_or_else(|| not_found("pool", &pool.id))?;
        let status = std::mem::take(&mut stored.state);
        *stored = pool.clone();
        stored.state = status;
        Ok(())
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        let mut state = self.record("delete_pool")?;
        let reads = state.linger_reads;
        if reads > 0 {
            let pool = state.pools.get_mut(id).ok_or_else(|| not_found("pool", id))?;
            pool.state = "deleting".to_string();
            state.lingering.insert(id.to_string(), reads);
            return Ok(());
        }
        state
            .pools
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("pool", id))
    }

    async fn get_guest(&self, name: &str) -> Result<Guest> {
        let state = self.record("get_guest")?;
        state.guests.get(name).cloned().ok_or_else(|| not_found("guest", name))
    }

    async fn create_external_guest(&self, guest: &ExternalGuest) -> Result<()> {
        let mut state = self.record("create_external_guest")?;
        if state.guests.contains_key(&guest.guest_name) {
            return Err(Error::Api {
                status: 409,
                message: format!("guest {} already exists", guest.guest_name),
            });
        }
        if !state.drop_creates {
            let record = Guest {
                name: guest.guest_name.clone(),
                state: "Running".to_string(),
                target_state: "Running".to_string(),
                address: guest.address.clone(),
                username: guest.username.clone(),
                ad_group: guest.ad_group.clone(),
                profile_id: guest.profile_id.clone(),
                realm: guest.realm.clone(),
                os: guest.os.clone(),
                disable_port_check: guest.disable_port_check,
                broker_options: Some(guest.broker_options.clone()),
                ..Default::default()
            };
            state.guests.insert(record.name.clone(), record);
        }
        Ok(())
    }

    async fn delete_guest(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_guest")?;
        state
            .guests
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("guest", name))
    }

    async fn get_template(&self, name: &str) -> Result<Template> {
        let state = self.record("get_template")?;
        state
            .templates
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("template", name))
    }

    async fn create_template(&self, template: &Template) -> Result<()> {
        let mut state = self.record("create_template")?;
        if !state.drop_creates {
            let mut stored = template.clone();
            stored.state = "available".to_string();
            state.templates.insert(stored.name.clone(), stored);
        }
        Ok(())
    }

    async fn update_template(&self, template: &Template) -> Result<()> {
        let mut state = self.record("update_template")?;
        let stored = state
            .templates
            .get_mut(&template.name)
            .ok_or_else(|| not_found("template", &template.name))?;
        let status = std::mem::take(&mut stored.state);
        *stored = template.clone();
        stored.state = status;
        Ok(())
    }

    async fn delete_template(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_template")?;
        state
            .templates
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("template", name))
    }

    async fn get_realm(&self, name: &str) -> Result<Realm> {
        let state = self.record("get_realm")?;
        state.realms.get(name).cloned().ok_or_else(|| not_found("realm", name))
    }

    async fn create_realm(&self, realm: &Realm) -> Result<()> {
        let mut state = self.record("create_realm")?;
        if !state.drop_creates {
            state.realms.insert(realm.name.clone(), realm.clone());
        }
        Ok(())
    }

    async fn update_realm(&self, realm: &Realm) -> Result<()> {
        let mut state = self.record("update_realm")?;
        let stored = state
            .realms
            .get_mut(&realm.name)
            .ok_or_else(|| not_found("realm", &realm.name))?;
        *stored = realm.clone();
        Ok(())
    }

    async fn delete_realm(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_realm")?;
        state
            .realms
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("realm", name))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let state = self.record("list_users")?;
        Ok(state.users.values().cloned().collect())
    }

    async fn get_user(&self, id: &str) -> Result<User> {
        let state = self.record("get_user")?;
        state.users.get(id).cloned().ok_or_else(|| not_found("user", id))
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        let mut state = self.record("create_user")?;
        if !state.drop_creates {
            state.users.insert(user.id.clone(), user.clone());
        }
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut state = self.record("update_user")?;
        let stored = state
            .users
            .get_mut(&user.id)
            .ok_or_else(|| not_found("user", &user.id))?;
        *stored = user.clone();
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        let mut state = self.record("delete_user")?;
        state
            .users
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("user", id))
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let state = self.record("list_profiles")?;
        Ok(state.profiles.values().cloned().collect())
    }

    async fn get_profile(&self, id: &str) -> Result<Profile> {
        let state = self.record("get_profile")?;
        state
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("profile", id))
    }

    async fn create_profile(&self, profile: &Profile) -> Result<()> {
        let mut state = self.record("create_profile")?;
        let id = state.next_id("profile");
        if !state.drop_creates {
            let mut stored = profile.clone();
            stored.id = id.clone();
            state.profiles.insert(id, stored);
        }
        Ok(())
    }

    async fn update_profile(&self, profile: &Profile) -> Result<()> {
        let mut state = self.record("update_profile")?;
        let stored = state
            .profiles
            .get_mut(&profile.id)
            .ok_or_else(|| not_found("profile", &profile.id))?;
        *stored = profile.clone();
        Ok(())
    }

    async fn delete_profile(&self, id: &str) -> Result<()> {
        let mut state = self.record("delete_profile")?;
        state
            .profiles
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("profile", id))
    }

    async fn cluster_id(&self) -> Result<String> {
        let state = self.record("cluster_id")?;
        state
            .cluster
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or_else(|| Error::unexpected("no cluster configured"))
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        let state = self.record("get_cluster")?;
        state
            .cluster
            .clone()
            .filter(|c| c.id == id)
            .ok_or_else(|| not_found("cluster", id))
    }

    async fn set_license(&self, cluster_id: &str, _license: &str) -> Result<()> {
        let mut state = self.record("set_license")?;
        let cluster = state
            .cluster
            .as_mut()
            .filter(|c| c.id == cluster_id)
            .ok_or_else(|| not_found("cluster", cluster_id))?;
        cluster.license = Some(License {
            license_type: "enterprise".to_string(),
            expiration: "2030-01-01".to_string(),
            max_guests: 100,
        });
        Ok(())
    }

    async fn get_gateway(&self, _cluster_id: &str) -> Result<ClusterGateway> {
        let state = self.record("get_gateway")?;
        Ok(state.gateway.clone())
    }

    async fn set_gateway(&self, _cluster_id: &str, gateway: &ClusterGateway) -> Result<()> {
        let mut state = self.record("set_gateway")?;
        state.gateway = gateway.clone();
        Ok(())
    }

    async fn enable_shared_storage(
        &self,
        cluster_id: &str,
        _utilization: u32,
        _set_size: u32,
    ) -> Result<Task> {
        let mut state = self.record("enable_shared_storage")?;
        let id = state.next_id("sp");
        state.storage_pools.insert(
            id.clone(),
            StoragePool {
                id: id.clone(),
                name: "shared".to_string(),
                pool_type: "rbd".to_string(),
                ..Default::default()
            },
        );
        if let Some(cluster) = state.cluster.as_mut() {
            cluster.shared_storage = Some(SharedStorageInfo { id, enabled: true });
        }
        Ok(state.submit(
            "enable_shared_storage",
            TaskRef {
                cluster: Some(cluster_id.to_string()),
                ..Default::default()
            },
        ))
    }

    async fn disable_shared_storage(&self, cluster_id: &str) -> Result<Task> {
        let mut state = self.record("disable_shared_storage")?;
        let shared = state
            .cluster
            .as_mut()
            .and_then(|c| c.shared_storage.take());
        if let Some(shared) = shared {
            state.storage_pools.remove(&shared.id);
        }
        Ok(state.submit(
            "disable_shared_storage",
            TaskRef {
                cluster: Some(cluster_id.to_string()),
                ..Default::default()
            },
        ))
    }
}
