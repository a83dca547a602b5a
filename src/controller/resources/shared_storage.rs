//! Cluster shared storage
//!
//! Enabling shared storage builds a distributed storage pool across the
//! cluster's hosts. The control plane refuses while too few hosts have
//! joined, so enable and disable are retried for retryable failures. The
//! resulting pool's id is the object id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Kind;
use crate::client::types::StoragePool;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::controller::task::await_task;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedStorageSpec {
    /// Percentage of each host's free space to contribute
    pub utilization: u32,
    /// Minimum number of hosts in a replica set
    pub set_size: u32,
}

impl Default for SharedStorageSpec {
    fn default() -> Self {
        Self {
            utilization: 75,
            set_size: 3,
        }
    }
}

impl SharedStorageSpec {
    fn validate(&self) -> Result<()> {
        if self.utilization == 0 || self.utilization > 100 {
            return Err(Error::validation(format!(
                "shared storage utilization must be 1-100, got {}",
                self.utilization
            )));
        }
        if self.set_size == 0 {
            return Err(Error::validation("shared storage set_size must be at least 1"));
        }
        Ok(())
    }
}

pub struct SharedStorageResource;

impl SharedStorageResource {
    async fn shared_pool(ctx: &ReconcileContext) -> Result<Option<StoragePool>> {
        let gateway = ctx.gateway();
        let cluster_id = gateway.cluster_id().await?;
        let cluster = gateway.get_cluster(&cluster_id).await?;
        match cluster.shared_storage_id() {
            Some(id) => gateway.get_storage_pool(id).await.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResourceKind for SharedStorageResource {
    type Spec = SharedStorageSpec;
    type Object = StoragePool;

    const KIND: Kind = Kind::SharedStorage;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &SharedStorageSpec,
    ) -> Result<Option<StoragePool>> {
        spec.validate()?;
        Self::shared_pool(ctx).await
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &SharedStorageSpec) -> Result<String> {
        let gateway = ctx.gateway();
        let cluster_id = gateway.cluster_id().await.step("resolve cluster")?;
        let cluster_id = cluster_id.as_str();

        info!(cluster = %cluster_id, utilization = spec.utilization, set_size = spec.set_size, "Enabling shared storage");
        with_retry(ctx, "enable shared storage", 0, || async move {
            let task = gateway
                .enable_shared_storage(cluster_id, spec.utilization, spec.set_size)
                .await?;
            await_task(ctx, task).await
        })
        .await
        .step("enable shared storage")?;

        let cluster = gateway.get_cluster(cluster_id).await.step("re-read cluster")?;
        cluster
            .shared_storage_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Vanished {
                kind: Kind::SharedStorage,
                id: cluster_id.to_string(),
                step: "create",
            })
    }

    /// Utilization and set size are fixed once enabled
    async fn apply_delta(
        &self,
        _ctx: &ReconcileContext,
        _spec: &SharedStorageSpec,
        current: StoragePool,
    ) -> Result<()> {
        debug!(pool = %current.id, "Shared storage has no updatable fields");
        Ok(())
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<StoragePool> {
        Self::shared_pool(ctx).await?.ok_or_else(|| Error::NotFound {
            kind: Kind::SharedStorage,
            id: id.to_string(),
        })
    }

    async fn delete(&self, ctx: &ReconcileContext, _id: &str, _current: StoragePool) -> Result<()> {
        let gateway = ctx.gateway();
        let cluster_id = gateway.cluster_id().await.step("resolve cluster")?;
        let cluster_id = cluster_id.as_str();

        info!(cluster = %cluster_id, "Disabling shared storage");
        with_retry(ctx, "disable shared storage", 0, || async move {
            let task = gateway.disable_shared_storage(cluster_id).await?;
            await_task(ctx, task).await
        })
        .await
        .step("disable shared storage")?;
        Ok(())
    }

    fn object_id(&self, pool: &StoragePool) -> String {
        pool.id.clone()
    }

    fn project(&self, pool: &StoragePool) -> CallerState {
        Projection::new()
            .set("id", pool.id.as_str())
            .set("name", pool.name.as_str())
            .set("type", pool.pool_type.as_str())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_and_validation() {
        let spec: SharedStorageSpec = serde_json::from_value(json!({})).unwrap();
        assert_eq!(spec, SharedStorageSpec::default());
        assert!(spec.validate().is_ok());

        let spec = SharedStorageSpec {
            utilization: 120,
            ..Default::default()
        };
        assert!(matches!(spec.validate(), Err(Error::ValidationError(_))));
    }
}
