//! Broker gateway entries
//!
//! The cluster keeps a single gateway document with one entry per host. A
//! gateway host is that entry, identified by the host id; every change is a
//! read-modify-write of the whole document.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Kind;
use crate::client::types::{ClusterGateway, GatewayHost};
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayHostSpec {
    pub host_id: String,
    pub start_port: u16,
    pub end_port: u16,
    /// Address clients use to reach this gateway
    pub external_address: String,
}

impl GatewayHostSpec {
    fn validate(&self) -> Result<()> {
        if self.host_id.is_empty() {
            return Err(Error::validation("gateway host needs a host_id"));
        }
        if self.start_port == 0 || self.start_port > self.end_port {
            return Err(Error::validation(format!(
                "gateway host {} has invalid port range {}-{}",
                self.host_id, self.start_port, self.end_port
            )));
        }
        Ok(())
    }

    fn entry(&self) -> GatewayHost {
        GatewayHost {
            start_port: self.start_port,
            end_port: self.end_port,
            external_address: self.external_address.clone(),
        }
    }
}

/// One host's entry in the cluster gateway document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayEntry {
    pub host_id: String,
    pub host: GatewayHost,
}

pub struct GatewayHostResource;

impl GatewayHostResource {
    async fn document(ctx: &ReconcileContext) -> Result<(String, ClusterGateway)> {
        let gateway = ctx.gateway();
        let cluster_id = gateway.cluster_id().await?;
        let document = gateway.get_gateway(&cluster_id).await?;
        Ok((cluster_id, document))
    }

    async fn write(ctx: &ReconcileContext, cluster_id: &str, document: &ClusterGateway) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("write gateway of {cluster_id}"), 0, || {
            gateway.set_gateway(cluster_id, document)
        })
        .await
        .step("write gateway")
    }

    async fn put_entry(ctx: &ReconcileContext, spec: &GatewayHostSpec) -> Result<()> {
        let (cluster_id, mut document) = Self::document(ctx).await.step("read gateway")?;
        if !document.enabled {
            info!(cluster = %cluster_id, "Enabling cluster gateway");
            document.enabled = true;
            document.client_source_isolation = true;
        }
        document.hosts.insert(spec.host_id.clone(), spec.entry());
        Self::write(ctx, &cluster_id, &document).await
    }
}

#[async_trait]
impl ResourceKind for GatewayHostResource {
    type Spec = GatewayHostSpec;
    type Object = GatewayEntry;

    const KIND: Kind = Kind::GatewayHost;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &GatewayHostSpec,
    ) -> Result<Option<GatewayEntry>> {
        spec.validate()?;
        let (_, document) = Self::document(ctx).await?;
        Ok(document.hosts.get(&spec.host_id).map(|host| GatewayEntry {
            host_id: spec.host_id.clone(),
            host: host.clone(),
        }))
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &GatewayHostSpec) -> Result<String> {
        let gateway = ctx.gateway();
        let (host, cluster) = futures::join!(gateway.get_host(&spec.host_id), gateway.cluster_id());
        match host {
            Err(e) if e.is_not_found() => {
                return Err(Error::validation(format!("host {} not found", spec.host_id)))
            }
            other => {
                other.step("check host")?;
            }
        }
        cluster.step("resolve cluster")?;

        info!(host = %spec.host_id, ports = %format!("{}-{}", spec.start_port, spec.end_port), "Adding gateway host");
        Self::put_entry(ctx, spec).await?;
        Ok(spec.host_id.clone())
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &GatewayHostSpec,
        current: GatewayEntry,
    ) -> Result<()> {
        if current.host == spec.entry() {
            return Ok(());
        }
        info!(host = %spec.host_id, "Updating gateway host");
        Self::put_entry(ctx, spec).await
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<GatewayEntry> {
        let (_, document) = Self::document(ctx).await?;
        document
            .hosts
            .get(id)
            .map(|host| GatewayEntry {
                host_id: id.to_string(),
                host: host.clone(),
            })
            .ok_or_else(|| Error::NotFound {
                kind: Kind::GatewayHost,
                id: id.to_string(),
            })
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: GatewayEntry) -> Result<()> {
        let (cluster_id, mut document) = Self::document(ctx).await.step("read gateway")?;
        if document.hosts.remove(id).is_none() {
            return Ok(());
        }
        Self::write(ctx, &cluster_id, &document).await
    }

    fn object_id(&self, entry: &GatewayEntry) -> String {
        entry.host_id.clone()
    }

    fn project(&self, entry: &GatewayEntry) -> CallerState {
        Projection::new()
            .set("host_id", entry.host_id.as_str())
            .set("start_port", entry.host.start_port)
            .set("end_port", entry.host.end_port)
            .set("external_address", entry.host.external_address.as_str())
            .build()
    }
}
