//! Storage pools
//!
//! Pools are looked up by name. The control plane tags every pool `global`;
//! the engine always sends it and strips it again when projecting. Delete is
//! refused with 423 while guests or templates still use the pool, so the
//! delete call is retried until the lock clears or the budget runs out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{same_members, Kind, Secret};
use crate::client::types::StoragePool;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

pub const GLOBAL_TAG: &str = "global";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePoolSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: String,
    pub server: String,
    pub path: String,
    pub url: String,
    pub username: String,
    pub password: Secret,
    pub key: Secret,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: Secret,
    pub s3_region: String,
    pub mount_options: Vec<String>,
    pub roles: Vec<String>,
    pub tags: Vec<String>,
    pub hosts: Vec<String>,
    /// ocfs2 only
    pub device: String,
    pub fs_name: String,
    pub create_filesystem: bool,
    pub clear_disk: bool,
}

impl StoragePoolSpec {
    /// Tags as sent to the control plane, `global` first
    pub fn remote_tags(&self) -> Vec<String> {
        std::iter::once(GLOBAL_TAG.to_string())
            .chain(self.tags.iter().filter(|t| *t != GLOBAL_TAG).cloned())
            .collect()
    }

    fn to_remote(&self) -> StoragePool {
        let ocfs2 = self.pool_type == "ocfs2";
        StoragePool {
            name: self.name.clone(),
            pool_type: self.pool_type.clone(),
            server: self.server.clone(),
            path: self.path.clone(),
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.expose().to_string(),
            key: self.key.expose().to_string(),
            s3_access_key_id: self.s3_access_key_id.clone(),
            s3_secret_access_key: self.s3_secret_access_key.expose().to_string(),
            s3_region: self.s3_region.clone(),
            mount_options: self.mount_options.clone(),
            roles: self.roles.clone(),
            tags: self.remote_tags(),
            hosts: self.hosts.clone(),
            device: if ocfs2 { self.device.clone() } else { String::new() },
            fs_name: if ocfs2 { self.fs_name.clone() } else { String::new() },
            create_filesystem: ocfs2 && self.create_filesystem,
            clear_disk: ocfs2 && self.clear_disk,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("storage pool name must be set"));
        }
        if self.pool_type.is_empty() {
            return Err(Error::validation(format!(
                "storage pool {} needs a type",
                self.name
            )));
        }
        Ok(())
    }
}

pub struct StoragePoolResource;

#[async_trait]
impl ResourceKind for StoragePoolResource {
    type Spec = StoragePoolSpec;
    type Object = StoragePool;

    const KIND: Kind = Kind::StoragePool;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &StoragePoolSpec,
    ) -> Result<Option<StoragePool>> {
        spec.validate()?;
        ctx.gateway().find_storage_pool(&spec.name).await
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &StoragePoolSpec) -> Result<String> {
        let gateway = ctx.gateway();
        gateway
            .create_storage_pool(&spec.to_remote())
            .await
            .step("post storage pool")?;

        match gateway
            .find_storage_pool(&spec.name)
            .await
            .step("resolve id")?
        {
            Some(pool) => Ok(pool.id),
            None => Err(Error::Vanished {
                kind: Kind::StoragePool,
                id: spec.name.clone(),
                step: "create",
            }),
        }
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &StoragePoolSpec,
        current: StoragePool,
    ) -> Result<()> {
        let tags = spec.remote_tags();
        if same_members(&current.roles, &spec.roles)
            && same_members(&current.tags, &tags)
            && same_members(&current.hosts, &spec.hosts)
        {
            return Ok(());
        }

        info!(pool = %current.id, "Updating storage pool roles, tags or hosts");
        let mut updated = spec.to_remote();
        updated.id = current.id;
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("update storage pool {}", updated.id), 0, || {
            gateway.update_storage_pool(&updated)
        })
        .await
        .step("put storage pool")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<StoragePool> {
        ctx.gateway().get_storage_pool(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: StoragePool) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete storage pool {id}"), 0, || {
            gateway.delete_storage_pool(id)
        })
        .await
    }

    fn object_id(&self, pool: &StoragePool) -> String {
        pool.id.clone()
    }

    fn project(&self, pool: &StoragePool) -> CallerState {
        let tags: Vec<String> = pool
            .tags
            .iter()
            .filter(|t| *t != GLOBAL_TAG)
            .cloned()
            .collect();

        let mut projection = Projection::new()
            .set("id", pool.id.as_str())
            .set("name", pool.name.as_str())
            .set("type", pool.pool_type.as_str())
            .set_non_empty("server", &pool.server)
            .set_non_empty("path", &pool.path)
            .set_non_empty("url", &pool.url)
            .set_non_empty("username", &pool.username)
            .set_non_empty("s3_access_key_id", &pool.s3_access_key_id)
            .set_non_empty("s3_region", &pool.s3_region)
            .set_non_empty("device", &pool.device)
            .set_non_empty("fs_name", &pool.fs_name)
            .set("mount_options", pool.mount_options.clone())
            .set("roles", pool.roles.clone())
            .set("tags", tags);
        if !pool.hosts.is_empty() {
            projection = projection.set("hosts", pool.hosts.clone());
        }
        projection.build()
    }
}
