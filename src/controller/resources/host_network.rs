//! Named networks on a host's appliance
//!
//! A network lives under its host and is addressed as `{host_id}/{name}`.
//! Setting a network is a whole-object put, so create and update share it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Kind;
use crate::client::types::HostNetwork;
use crate::controller::classify::NotFoundExt;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostNetworkSpec {
    pub host_id: String,
    pub name: String,
    /// Physical interface; the appliance default when unset
    pub interface: Option<String>,
    pub vlan: u32,
    pub dhcp: bool,
    pub ip: Option<String>,
    pub mask: Option<String>,
}

impl HostNetworkSpec {
    fn validate(&self) -> Result<()> {
        if self.host_id.is_empty() || self.name.is_empty() {
            return Err(Error::validation("host network needs a host_id and a name"));
        }
        if self.name.contains('/') {
            return Err(Error::validation(format!(
                "host network name {} must not contain '/'",
                self.name
            )));
        }
        if self.vlan > 4094 {
            return Err(Error::validation(format!(
                "host network {} has invalid vlan {}",
                self.name, self.vlan
            )));
        }
        if !self.dhcp && self.ip.is_some() != self.mask.is_some() {
            return Err(Error::validation(format!(
                "host network {} needs both ip and mask for a static address",
                self.name
            )));
        }
        Ok(())
    }

    fn to_remote(&self) -> HostNetwork {
        HostNetwork {
            name: self.name.clone(),
            interface: self.interface.clone().unwrap_or_default(),
            vlan: self.vlan,
            dhcp: self.dhcp,
            ip: self.ip.clone().unwrap_or_default(),
            mask: self.mask.clone().unwrap_or_default(),
        }
    }

    /// Unset optional fields keep whatever the host reports
    fn differs(&self, current: &HostNetwork) -> bool {
        let changed = |want: &Option<String>, have: &str| {
            want.as_deref().is_some_and(|w| w != have)
        };
        current.vlan != self.vlan
            || current.dhcp != self.dhcp
            || changed(&self.interface, &current.interface)
            || changed(&self.ip, &current.ip)
            || changed(&self.mask, &current.mask)
    }
}

/// A network together with the host it belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostNetworkEntry {
    pub host_id: String,
    pub network: HostNetwork,
}

fn network_id(host_id: &str, name: &str) -> String {
    format!("{host_id}/{name}")
}

fn split_id(id: &str) -> Result<(&str, &str)> {
    id.split_once('/')
        .filter(|(host, name)| !host.is_empty() && !name.is_empty())
        .ok_or_else(|| Error::validation(format!("malformed host network id {id}")))
}

pub struct HostNetworkResource;

#[async_trait]
impl ResourceKind for HostNetworkResource {
    type Spec = HostNetworkSpec;
    type Object = HostNetworkEntry;

    const KIND: Kind = Kind::HostNetwork;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &HostNetworkSpec,
    ) -> Result<Option<HostNetworkEntry>> {
        spec.validate()?;
        let gateway = ctx.gateway();
        match gateway.get_host(&spec.host_id).await {
            Err(e) if e.is_not_found() => {
                return Err(Error::validation(format!("host {} not found", spec.host_id)))
            }
            other => {
                other?;
            }
        }
        Ok(gateway
            .get_host_network(&spec.host_id, &spec.name)
            .await
            .or_absent()?
            .map(|network| HostNetworkEntry {
                host_id: spec.host_id.clone(),
                network,
            }))
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &HostNetworkSpec) -> Result<String> {
        info!(host = %spec.host_id, network = %spec.name, vlan = spec.vlan, "Creating host network");
        ctx.gateway()
            .set_host_network(&spec.host_id, &spec.to_remote())
            .await
            .step("put host network")?;
        Ok(network_id(&spec.host_id, &spec.name))
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &HostNetworkSpec,
        current: HostNetworkEntry,
    ) -> Result<()> {
        if !spec.differs(&current.network) {
            return Ok(());
        }
        info!(host = %current.host_id, network = %spec.name, "Updating host network");
        let gateway = ctx.gateway();
        let host_id = current.host_id.as_str();
        let updated = spec.to_remote();
        with_retry(ctx, &format!("update network {}", spec.name), 0, || {
            gateway.set_host_network(host_id, &updated)
        })
        .await
        .step("put host network")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<HostNetworkEntry> {
        let (host_id, name) = split_id(id)?;
        let network = ctx.gateway().get_host_network(host_id, name).await?;
        Ok(HostNetworkEntry {
            host_id: host_id.to_string(),
            network,
        })
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, current: HostNetworkEntry) -> Result<()> {
        let gateway = ctx.gateway();
        let host_id = current.host_id.as_str();
        let name = current.network.name.as_str();
        with_retry(ctx, &format!("delete network {id}"), 0, || {
            gateway.delete_host_network(host_id, name)
        })
        .await
    }

    fn object_id(&self, entry: &HostNetworkEntry) -> String {
        network_id(&entry.host_id, &entry.network.name)
    }

    fn project(&self, entry: &HostNetworkEntry) -> CallerState {
        let network = &entry.network;
        Projection::new()
            .set("host_id", entry.host_id.as_str())
            .set("name", network.name.as_str())
            .set_non_empty("interface", &network.interface)
            .set("vlan", network.vlan)
            .set("dhcp", network.dhcp)
            .set_non_empty("ip", &network.ip)
            .set_non_empty("mask", &network.mask)
            .build()
    }
}
