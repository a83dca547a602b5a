//! Standalone virtual machines
//!
//! A virtual machine is a pool of type `standalone` with density 1/1 and a
//! persistent guest. The guest record is named after the pool (upper-cased,
//! spaces replaced by `_`) and only exists once the control plane has built
//! it, so waiting for readiness tolerates NotFound.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::guest_pool::{project_pool, BackupSpec};
use super::Kind;
use crate::client::types::{
    Backup, BrokerOptions, CloudInit, Guest, GuestProfile, NetworkInterface, Pool, PoolAffinity,
    PoolDisk,
};
use crate::controller::classify::NotFoundExt;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::controller::task::{poll_until, Probe};
use crate::error::{Error, Result, StepContext};

/// What "ready" means when waiting on a freshly created machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyMethod {
    /// Guest state equals its target state
    #[default]
    TargetState,
    /// Guest agent reports ready
    Ready,
    /// At least one interface has an ip address
    IpAddress,
}

impl ReadyMethod {
    pub fn is_satisfied(self, guest: &Guest) -> bool {
        match self {
            ReadyMethod::TargetState => guest.at_target_state(),
            ReadyMethod::Ready => guest.ready,
            ReadyMethod::IpAddress => guest.has_ip_address(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskAttachment {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub storage_id: String,
    pub filename: String,
    pub disk_driver: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSpec {
    pub network: String,
    pub vlan: u32,
    pub emulation: String,
}

impl From<&InterfaceSpec> for NetworkInterface {
    fn from(spec: &InterfaceSpec) -> Self {
        NetworkInterface {
            network: spec.network.clone(),
            vlan: spec.vlan,
            emulation: spec.emulation.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineSpec {
    pub name: String,
    pub os: String,
    pub firmware: String,
    pub display_driver: String,
    pub cpu: u32,
    /// Memory in MB
    pub memory: u32,
    pub gpu: bool,
    pub inject_agent: bool,
    pub disks: Vec<DiskAttachment>,
    pub interfaces: Vec<InterfaceSpec>,
    pub cloudinit_userdata: Option<String>,
    pub cloudinit_networkconfig: Option<String>,
    pub backup: Option<BackupSpec>,
    pub allowed_hosts: Vec<String>,
    pub broker: Option<BrokerOptions>,
    pub wait_for_ready: bool,
    pub ready_method: ReadyMethod,
}

impl VirtualMachineSpec {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("virtual machine name must be set"));
        }
        if self.cpu == 0 || self.memory == 0 {
            return Err(Error::validation(format!(
                "virtual machine {} needs cpu and memory",
                self.name
            )));
        }
        Ok(())
    }

    fn to_remote(&self) -> Pool {
        let cloud_init = if self.cloudinit_userdata.is_some() || self.cloudinit_networkconfig.is_some()
        {
            Some(CloudInit {
                enabled: true,
                user_data: self.cloudinit_userdata.clone().unwrap_or_default(),
                network_config: self.cloudinit_networkconfig.clone().unwrap_or_default(),
            })
        } else {
            None
        };

        Pool {
            name: self.name.clone(),
            pool_type: "standalone".to_string(),
            density: vec![1, 1],
            inject_agent: self.inject_agent,
            guest_profile: Some(GuestProfile {
                os: self.os.clone(),
                firmware: self.firmware.clone(),
                vga: self.display_driver.clone(),
                gpu: self.gpu,
                persistent: true,
                cpu: vec![self.cpu, self.cpu],
                mem: vec![self.memory, self.memory],
                cloud_init,
                disks: self
                    .disks
                    .iter()
                    .map(|d| PoolDisk {
                        disk_type: d.disk_type.clone(),
                        storage_id: d.storage_id.clone(),
                        filename: d.filename.clone(),
                        disk_driver: d.disk_driver.clone(),
                    })
                    .collect(),
                interfaces: self.interfaces.iter().map(NetworkInterface::from).collect(),
                broker_options: self.broker.clone(),
                ..Default::default()
            }),
            backup: self.backup.as_ref().map(Backup::from),
            pool_affinity: Some(PoolAffinity {
                allowed_host_ids: self.allowed_hosts.clone(),
            }),
            ..Default::default()
        }
    }

    /// Whether any attribute managed by this spec differs from `current`
    fn differs(&self, current: &Pool) -> bool {
        let desired = self.to_remote();
        let want = desired.guest_profile.unwrap_or_default();
        let have = current.guest_profile.clone().unwrap_or_default();
        let allowed = current
            .pool_affinity
            .as_ref()
            .map(|a| a.allowed_host_ids.clone())
            .unwrap_or_default();

        current.inject_agent != desired.inject_agent
            || have.os != want.os
            || have.firmware != want.firmware
            || have.vga != want.vga
            || have.gpu != want.gpu
            || have.cpu != want.cpu
            || have.mem != want.mem
            || have.disks != want.disks
            || have.interfaces != want.interfaces
            || have.cloud_init != want.cloud_init
            || current.backup != desired.backup
            || !super::same_members(&allowed, &self.allowed_hosts)
            || (self.broker.is_some() && have.broker_options != self.broker)
    }
}

/// Name of the guest record built for pool `pool_name`
pub fn guest_name(pool_name: &str) -> String {
    pool_name.to_uppercase().replace(' ', "_")
}

/// A standalone pool together with its guest record, when built
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualMachine {
    pub pool: Pool,
    pub guest: Option<Guest>,
}

pub struct VirtualMachineResource;

#[async_trait]
impl ResourceKind for VirtualMachineResource {
    type Spec = VirtualMachineSpec;
    type Object = VirtualMachine;

    const KIND: Kind = Kind::VirtualMachine;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &VirtualMachineSpec,
    ) -> Result<Option<VirtualMachine>> {
        spec.validate()?;
        match ctx.gateway().find_pool(&spec.name).await? {
            Some(pool) => Ok(Some(self.fetch(ctx, &pool.id).await?)),
            None => Ok(None),
        }
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &VirtualMachineSpec) -> Result<String> {
        let gateway = ctx.gateway();
        gateway
            .create_pool(&spec.to_remote())
            .await
            .step("post standalone pool")?;

        let pool = gateway
            .find_pool(&spec.name)
            .await
            .step("resolve id")?
            .ok_or_else(|| Error::Vanished {
                kind: Kind::VirtualMachine,
                id: spec.name.clone(),
                step: "create",
            })?;

        if spec.wait_for_ready {
            let name = guest_name(&pool.name);
            let method = spec.ready_method;
            info!(guest = %name, method = ?method, "Waiting for guest");

            let guest = name.as_str();
            poll_until(ctx, &format!("wait for guest {guest}"), || async move {
                Ok::<_, Error>(match gateway.get_guest(guest).await.or_absent()? {
                    None => Probe::Pending(format!("guest {guest} not built yet")),
                    Some(g) if method.is_satisfied(&g) => Probe::Ready(()),
                    Some(g) => Probe::Pending(format!(
                        "guest {guest} is {} (target {})",
                        g.state, g.target_state
                    )),
                })
            })
            .await?;
        }
        Ok(pool.id)
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &VirtualMachineSpec,
        current: VirtualMachine,
    ) -> Result<()> {
        if !spec.differs(&current.pool) {
            return Ok(());
        }

        let mut desired = spec.to_remote();
        desired.id = current.pool.id.clone();
        if spec.broker.is_none() {
            if let (Some(d), Some(c)) = (
                desired.guest_profile.as_mut(),
                current.pool.guest_profile.as_ref(),
            ) {
                d.broker_options = c.broker_options.clone();
            }
        }

        info!(pool = %desired.id, "Updating virtual machine");
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("update pool {}", desired.id), 0, || {
            gateway.update_pool(&desired)
        })
        .await
        .step("put pool")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<VirtualMachine> {
        let gateway = ctx.gateway();
        let pool = gateway.get_pool(id).await?;
        let guest = gateway.get_guest(&guest_name(&pool.name)).await.or_absent()?;
        Ok(VirtualMachine { pool, guest })
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: VirtualMachine) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete pool {id}"), 0, || gateway.delete_pool(id)).await
    }

    fn object_id(&self, vm: &VirtualMachine) -> String {
        vm.pool.id.clone()
    }

    fn project(&self, vm: &VirtualMachine) -> CallerState {
        let mut projection = project_pool(&vm.pool).set("inject_agent", vm.pool.inject_agent);
        let profile = vm.pool.guest_profile.clone().unwrap_or_default();

        projection = projection.nest_list(
            "disks",
            profile.disks.iter().map(|d| {
                Projection::new()
                    .set("type", d.disk_type.as_str())
                    .set("storage_id", d.storage_id.as_str())
                    .set("filename", d.filename.as_str())
                    .set("disk_driver", d.disk_driver.as_str())
            }),
        );

        match vm.guest.as_ref().filter(|g| !g.interfaces.is_empty()) {
            Some(guest) => {
                projection = projection.set("guest_name", guest.name.as_str()).nest_list(
                    "interfaces",
                    guest.interfaces.iter().map(|i| {
                        Projection::new()
                            .set("network", i.network.as_str())
                            .set("vlan", i.vlan)
                            .set("emulation", i.emulation.as_str())
                            .set_non_empty("ip_address", &i.ip_address)
                            .set_non_empty("mac_address", &i.mac_address)
                    }),
                );
            }
            None => {
                projection = projection.nest_list(
                    "interfaces",
                    profile.interfaces.iter().map(|i| {
                        Projection::new()
                            .set("network", i.network.as_str())
                            .set("vlan", i.vlan)
                            .set("emulation", i.emulation.as_str())
                    }),
                );
            }
        }
        projection.build()
    }
}
