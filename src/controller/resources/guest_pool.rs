//! Guest pools
//!
//! A pool is built from a template; on create the template supplies the
//! guest OS, display driver and default cpu/memory. Optionally the engine
//! waits for the pool to finish building (state `tracking`). Pools are
//! removed asynchronously and stay in state `deleting` for a while.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Kind;
use crate::client::types::{
    Backup, BrokerConnection, BrokerOptions, CloudInit, GuestProfile, Pool, PoolAffinity,
};
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::controller::task::{poll_until, Probe};
use crate::error::{Error, Result, StepContext};

pub const STATE_TRACKING: &str = "tracking";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSpec {
    pub enabled: bool,
    pub frequency: String,
    pub target: String,
}

impl From<&BackupSpec> for Backup {
    fn from(spec: &BackupSpec) -> Self {
        Backup {
            enabled: spec.enabled,
            frequency: spec.frequency.clone(),
            target_storage_id: spec.target.clone(),
        }
    }
}

pub(crate) fn project_backup(backup: Option<&Backup>) -> Option<Projection> {
    backup.map(|b| {
        Projection::new()
            .set("enabled", b.enabled)
            .set("frequency", b.frequency.as_str())
            .set("target", b.target_storage_id.as_str())
    })
}

pub(crate) fn project_broker(options: Option<&BrokerOptions>) -> Option<Projection> {
    options.filter(|o| !o.connections.is_empty()).map(|o| {
        Projection::new()
            .set_non_empty("default_connection", &o.default_connection)
            .nest_list(
                "connections",
                o.connections.iter().map(|c: &BrokerConnection| {
                    Projection::new()
                        .set("name", c.name.as_str())
                        .set_non_empty("description", &c.description)
                        .set("port", c.port)
                        .set("protocol", c.protocol.as_str())
                        .set("disable_html5", c.disable_html5)
                        .set("gateway_disabled", c.gateway.disabled)
                        .set("gateway_persistent", c.gateway.persistent)
                        .set("gateway_protocols", c.gateway.protocols.clone())
                }),
            )
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestPoolSpec {
    pub name: String,
    pub template: String,
    pub profile_id: String,
    pub seed: String,
    pub storage_id: String,
    pub storage_type: String,
    /// `[min, max]` guests
    pub density: [u32; 2],
    pub persistent: bool,
    pub gpu: bool,
    /// Fixed vCPU count; template default when unset
    pub cpu: Option<u32>,
    /// Fixed memory in MB; template default when unset
    pub memory: Option<u32>,
    pub cloudinit_userdata: Option<String>,
    pub backup: Option<BackupSpec>,
    pub allowed_hosts: Vec<String>,
    pub broker: Option<BrokerOptions>,
    /// Wait until the pool reaches `tracking` before returning from create
    pub wait_for_build: bool,
}

impl Default for GuestPoolSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            template: String::new(),
            profile_id: String::new(),
            seed: String::new(),
            storage_id: String::new(),
            storage_type: "disk".to_string(),
            density: [1, 1],
            persistent: false,
            gpu: false,
            cpu: None,
            memory: None,
            cloudinit_userdata: None,
            backup: None,
            allowed_hosts: Vec::new(),
            broker: None,
            wait_for_build: false,
        }
    }
}

impl GuestPoolSpec {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.template.is_empty() {
            return Err(Error::validation("guest pool needs a name and a template"));
        }
        if self.density[0] > self.density[1] {
            return Err(Error::validation(format!(
                "guest pool {} density min {} exceeds max {}",
                self.name, self.density[0], self.density[1]
            )));
        }
        Ok(())
    }

    /// Remote form of this spec; template-derived fields are filled by the caller
    fn to_remote(&self) -> Pool {
        Pool {
            name: self.name.clone(),
            pool_type: "vdi".to_string(),
            density: self.density.to_vec(),
            inject_agent: true,
            seed: self.seed.clone(),
            storage_id: self.storage_id.clone(),
            storage_type: self.storage_type.clone(),
            profile_id: self.profile_id.clone(),
            guest_profile: Some(GuestProfile {
                template_name: self.template.clone(),
                persistent: self.persistent,
                gpu: self.gpu,
                cpu: self.cpu.map(|c| vec![c, c]).unwrap_or_default(),
                mem: self.memory.map(|m| vec![m, m]).unwrap_or_default(),
                cloud_init: self.cloudinit_userdata.as_ref().map(|data| CloudInit {
                    enabled: true,
                    user_data: data.clone(),
                    network_config: String::new(),
                }),
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
        let profile = current.guest_profile.clone().unwrap_or_default();
        let allowed = current
            .pool_affinity
            .as_ref()
            .map(|a| a.allowed_host_ids.clone())
            .unwrap_or_default();

        current.density != self.density.to_vec()
            || current.profile_id != self.profile_id
            || current.seed != self.seed
            || profile.template_name != self.template
            || profile.persistent != self.persistent
            || profile.gpu != self.gpu
            || self.cpu.is_some_and(|c| profile.cpu != vec![c, c])
            || self.memory.is_some_and(|m| profile.mem != vec![m, m])
            || current.backup.as_ref() != self.backup.as_ref().map(Backup::from).as_ref()
            || !super::same_members(&allowed, &self.allowed_hosts)
            || (self.broker.is_some() && profile.broker_options != self.broker)
    }
}

pub struct GuestPoolResource;

#[async_trait]
impl ResourceKind for GuestPoolResource {
    type Spec = GuestPoolSpec;
    type Object = Pool;

    const KIND: Kind = Kind::GuestPool;

    async fn lookup_existing(&self, ctx: &ReconcileContext, spec: &GuestPoolSpec) -> Result<Option<Pool>> {
        spec.validate()?;
        ctx.gateway().find_pool(&spec.name).await
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &GuestPoolSpec) -> Result<String> {
        let gateway = ctx.gateway();
        let template = gateway
            .get_template(&spec.template)
            .await
            .step(format!("resolve template {}", spec.template))?;

        let mut pool = spec.to_remote();
        if let Some(profile) = pool.guest_profile.as_mut() {
            profile.os = template.os.clone();
            profile.vga = template.display_driver.clone();
            if profile.cpu.len() != 2 {
                profile.cpu = vec![template.vcpu, template.vcpu];
            }
            if profile.mem.len() != 2 {
                profile.mem = vec![template.mem, template.mem];
            }
        }

        gateway.create_pool(&pool).await.step("post pool")?;
        let id = match gateway.find_pool(&spec.name).await.step("resolve id")? {
            Some(created) => created.id,
            None => {
                return Err(Error::Vanished {
                    kind: Kind::GuestPool,
                    id: spec.name.clone(),
                    step: "create",
                })
            }
        };

        if spec.wait_for_build {
            info!(pool = %id, "Waiting for pool to build");
            let pool_id = id.as_str();
            poll_until(ctx, &format!("wait for pool {pool_id} to build"), || async move {
                let pool = gateway.get_pool(pool_id).await?;
                Ok::<_, Error>(if pool.state == STATE_TRACKING {
                    Probe::Ready(())
                } else {
                    Probe::Pending(format!("pool state is '{}'", pool.state))
                })
            })
            .await?;
        }
        Ok(id)
    }

    async fn apply_delta(&self, ctx: &ReconcileContext, spec: &GuestPoolSpec, current: Pool) -> Result<()> {
        if !spec.differs(&current) {
            return Ok(());
        }
        info!(pool = %current.id, "Updating guest pool");

        let mut updated = spec.to_remote();
        updated.id = current.id.clone();
        if let (Some(desired), Some(existing)) =
            (updated.guest_profile.as_mut(), current.guest_profile.as_ref())
        {
            desired.os = existing.os.clone();
            desired.vga = existing.vga.clone();
            if desired.cpu.is_empty() {
                desired.cpu = existing.cpu.clone();
            }
            if desired.mem.is_empty() {
                desired.mem = existing.mem.clone();
            }
            if desired.broker_options.is_none() {
                desired.broker_options = existing.broker_options.clone();
            }
        }
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("update pool {}", updated.id), 0, || {
            gateway.update_pool(&updated)
        })
        .await
        .step("put pool")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<Pool> {
        ctx.gateway().get_pool(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: Pool) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete pool {id}"), 0, || gateway.delete_pool(id)).await
    }

    fn object_id(&self, pool: &Pool) -> String {
        pool.id.clone()
    }

    fn project(&self, pool: &Pool) -> CallerState {
        project_pool(pool).build()
    }
}

/// Attributes shared by guest pools and standalone virtual machines
pub(crate) fn project_pool(pool: &Pool) -> Projection {
    let profile = pool.guest_profile.as_ref();
    let mut projection = Projection::new()
        .set("id", pool.id.as_str())
        .set("name", pool.name.as_str())
        .set("density", pool.density.clone())
        .set_non_empty("state", &pool.state)
        .set_non_empty("seed", &pool.seed)
        .set_non_empty("storage_id", &pool.storage_id)
        .set_non_empty("storage_type", &pool.storage_type)
        .set_non_empty("profile_id", &pool.profile_id)
        .nest("backup", project_backup(pool.backup.as_ref()))
        .set(
            "allowed_hosts",
            pool.pool_affinity
                .as_ref()
                .map(|a| a.allowed_host_ids.clone())
                .unwrap_or_default(),
        );

    if let Some(profile) = profile {
        projection = projection
            .set_non_empty("template", &profile.template_name)
            .set_non_empty("os", &profile.os)
            .set_non_empty("display_driver", &profile.vga)
            .set_non_empty("firmware", &profile.firmware)
            .set("persistent", profile.persistent)
            .set("gpu", profile.gpu)
            .set_opt("cpu", profile.cpu.first().copied())
            .set_opt("memory", profile.mem.first().copied())
            .set_opt(
                "cloudinit_enabled",
                profile.cloud_init.as_ref().map(|c| c.enabled),
            )
            .nest("broker", project_broker(profile.broker_options.as_ref()));
    }
    projection
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> GuestPoolSpec {
        GuestPoolSpec {
            name: "desk".to_string(),
            template: "win10".to_string(),
            profile_id: "prof-1".to_string(),
            density: [2, 4],
            ..Default::default()
        }
    }

    #[test]
    fn test_remote_form() {
        let pool = spec().to_remote();
        assert_eq!(pool.pool_type, "vdi");
        assert_eq!(pool.density, vec![2, 4]);
        assert!(pool.inject_agent);
        let profile = pool.guest_profile.unwrap();
        assert_eq!(profile.template_name, "win10");
        assert!(profile.cpu.is_empty());
        assert!(profile.cloud_init.is_none());
        assert_eq!(pool.pool_affinity.unwrap().allowed_host_ids.len(), 0);
    }

    #[test]
    fn test_density_bounds() {
        let mut s = spec();
        s.density = [5, 1];
        assert!(matches!(s.validate(), Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_differs() {
        let mut current = spec().to_remote();
        current.id = "p1".to_string();
        if let Some(p) = current.guest_profile.as_mut() {
            p.os = "win10".to_string();
            p.cpu = vec![2, 2];
            p.mem = vec![4096, 4096];
        }
        assert!(!spec().differs(&current));

        let mut grown = spec();
        grown.density = [2, 8];
        assert!(grown.differs(&current));

        let mut pinned = spec();
        pinned.cpu = Some(4);
        assert!(pinned.differs(&current));
    }

    #[test]
    fn test_projection_without_sub_documents() {
        let pool = Pool {
            id: "p1".to_string(),
            name: "desk".to_string(),
            density: vec![1, 2],
            ..Default::default()
        };
        let state = GuestPoolResource.project(&pool);
        assert_eq!(state["density"], json!([1, 2]));
        assert_eq!(state["allowed_hosts"], json!([]));
        assert!(!state.contains_key("backup"));
        assert!(!state.contains_key("template"));
    }

    #[test]
    fn test_projection_with_backup() {
        let mut s = spec();
        s.backup = Some(BackupSpec {
            enabled: true,
            frequency: "daily".to_string(),
            target: "sp-2".to_string(),
        });
        let state = GuestPoolResource.project(&s.to_remote());
        assert_eq!(
            state["backup"],
            json!({"enabled": true, "frequency": "daily", "target": "sp-2"})
        );
    }
}
