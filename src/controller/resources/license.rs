//! Cluster license
//!
//! The license key doubles as the id. A license cannot be removed from a
//! cluster, so deleting one only drops it from management.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Kind;
use crate::client::types::License;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::{DeleteMode, ResourceKind};
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseSpec {
    pub key: String,
}

/// The installed license together with the key it was installed from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledLicense {
    pub key: String,
    pub license: License,
}

pub struct LicenseResource;

#[async_trait]
impl ResourceKind for LicenseResource {
    type Spec = LicenseSpec;
    type Object = InstalledLicense;

    const KIND: Kind = Kind::License;

    /// An installed license carries no key, so nothing can be adopted
    async fn lookup_existing(
        &self,
        _ctx: &ReconcileContext,
        spec: &LicenseSpec,
    ) -> Result<Option<InstalledLicense>> {
        if spec.key.is_empty() {
            return Err(Error::validation("license key must be set"));
        }
        Ok(None)
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &LicenseSpec) -> Result<String> {
        let gateway = ctx.gateway();
        let cluster_id = gateway.cluster_id().await.step("resolve cluster")?;
        info!(cluster = %cluster_id, "Installing license");
        let cluster_id = cluster_id.as_str();
        with_retry(ctx, &format!("set license on {cluster_id}"), 0, || {
            gateway.set_license(cluster_id, &spec.key)
        })
        .await
        .step("set license")?;
        Ok(spec.key.clone())
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &LicenseSpec,
        current: InstalledLicense,
    ) -> Result<()> {
        if current.key == spec.key {
            return Ok(());
        }
        self.create(ctx, spec).await.map(|_| ())
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<InstalledLicense> {
        let gateway = ctx.gateway();
        let cluster_id = gateway.cluster_id().await?;
        let cluster = gateway.get_cluster(&cluster_id).await?;
        cluster
            .license
            .map(|license| InstalledLicense {
                key: id.to_string(),
                license,
            })
            .ok_or_else(|| Error::NotFound {
                kind: Kind::License,
                id: cluster_id,
            })
    }

    async fn delete(&self, _ctx: &ReconcileContext, _id: &str, _current: InstalledLicense) -> Result<()> {
        Ok(())
    }

    fn object_id(&self, installed: &InstalledLicense) -> String {
        installed.key.clone()
    }

    fn project(&self, installed: &InstalledLicense) -> CallerState {
        let license = &installed.license;
        Projection::new()
            .set("type", license.license_type.as_str())
            .set("expiration", license.expiration.as_str())
            .set("max_guests", license.max_guests)
            .build()
    }

    /// A new key replaces the installed license
    fn id_after_update(&self, spec: &LicenseSpec, _id: &str) -> String {
        spec.key.clone()
    }

    fn delete_mode(&self) -> DeleteMode {
        DeleteMode::DetachOnly
    }
}
