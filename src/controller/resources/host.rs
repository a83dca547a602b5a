//! Cluster hosts
//!
//! A host is joined by ip address or hostname. After the join task the host
//! may need a gateway-mode switch, an availability state transition and
//! appliance settings; each is applied only when it differs and is followed
//! by its settle wait. Owned hosts are drained to maintenance before unjoin.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Kind, Secret};
use crate::client::types::Host;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::{fetch_expected, ResourceKind};
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::controller::settle::{settle, SettlePoint};
use crate::controller::task::await_task;
use crate::error::{Error, Result, StepContext};

pub const STATE_AVAILABLE: &str = "available";
pub const STATE_MAINTENANCE: &str = "maintenance";
pub const STATE_UNREACHABLE: &str = "unreachable";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSpec {
    pub ip_address: Option<String>,
    pub hostname: Option<String>,
    /// Credentials used by the control plane to join the host
    pub username: String,
    pub password: Secret,
    pub gateway_only: bool,
    /// `available` or `maintenance`; ignored for gateway-only hosts
    pub state: String,
    pub log_level: Option<String>,
    pub max_clone_density: Option<u32>,
    pub ntp_servers: Option<String>,
    pub timezone: Option<String>,
}

impl Default for HostSpec {
    fn default() -> Self {
        Self {
            ip_address: None,
            hostname: None,
            username: "admin".to_string(),
            password: Secret::default(),
            gateway_only: false,
            state: STATE_AVAILABLE.to_string(),
            log_level: None,
            max_clone_density: None,
            ntp_servers: None,
            timezone: None,
        }
    }
}

impl HostSpec {
    /// Address used to join and to find the host: ip first, then hostname
    pub fn address(&self) -> Result<&str> {
        self.ip_address
            .as_deref()
            .filter(|a| !a.is_empty())
            .or_else(|| self.hostname.as_deref().filter(|h| !h.is_empty()))
            .ok_or_else(|| Error::validation("ip_address or hostname must be provided"))
    }

    fn validate(&self) -> Result<()> {
        self.address()?;
        match self.state.as_str() {
            STATE_AVAILABLE | STATE_MAINTENANCE => Ok(()),
            other => Err(Error::validation(format!(
                "host state must be '{STATE_AVAILABLE}' or '{STATE_MAINTENANCE}', got '{other}'"
            ))),
        }
    }
}

pub struct HostResource;

impl HostResource {
    /// Apply the appliance fields that are set and differ; returns whether anything changed
    fn merge_appliance(spec: &HostSpec, host: &mut Host) -> bool {
        let appliance = &mut host.appliance;
        let mut changed = false;

        if let Some(level) = spec.log_level.as_deref().filter(|l| !l.is_empty()) {
            if appliance.log_level != level {
                appliance.log_level = level.to_string();
                changed = true;
            }
        }
        if let Some(density) = spec.max_clone_density.filter(|d| *d != 0) {
            if appliance.max_clone_density != density {
                appliance.max_clone_density = density;
                changed = true;
            }
        }
        if let Some(ntp) = spec.ntp_servers.as_deref() {
            if appliance.ntp != ntp {
                appliance.ntp = ntp.to_string();
                changed = true;
            }
        }
        if let Some(tz) = spec.timezone.as_deref().filter(|t| !t.is_empty()) {
            if appliance.timezone != tz {
                appliance.timezone = tz.to_string();
                changed = true;
            }
        }
        changed
    }
}

#[async_trait]
impl ResourceKind for HostResource {
    type Spec = HostSpec;
    type Object = Host;

    const KIND: Kind = Kind::Host;

    async fn lookup_existing(&self, ctx: &ReconcileContext, spec: &HostSpec) -> Result<Option<Host>> {
        spec.validate()?;
        ctx.gateway().find_host(spec.address()?).await
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &HostSpec) -> Result<String> {
        let address = spec.address()?;
        let gateway = ctx.gateway();

        info!(address = %address, "Joining host");
        let task = with_retry(ctx, &format!("join host {address}"), 2, || {
            gateway.join_host(&spec.username, spec.password.expose(), address)
        })
        .await
        .step("submit join")?;
        let task = await_task(ctx, task).await.step("join")?;

        match task.created_id() {
            Some(id) => Ok(id.to_string()),
            None => gateway
                .find_host(address)
                .await?
                .map(|h| h.hostid)
                .ok_or_else(|| Error::unexpected(format!("join of {address} reported no host id"))),
        }
    }

    async fn apply_delta(&self, ctx: &ReconcileContext, spec: &HostSpec, current: Host) -> Result<()> {
        spec.validate()?;
        let gateway = ctx.gateway();
        let id = current.hostid.clone();
        let id = id.as_str();
        let mut host = current;

        if host.appliance.is_gateway() != spec.gateway_only {
            info!(host = %id, gateway_only = spec.gateway_only, "Switching gateway mode");
            with_retry(ctx, &format!("set gateway mode on {id}"), 0, || {
                gateway.set_gateway_mode(id, spec.gateway_only)
            })
            .await
            .step("set gateway mode")?;
            settle(ctx, SettlePoint::AfterRoleChange).await?;
            host = fetch_expected(self, ctx, id, "role change").await?;
        }

        if !spec.gateway_only && host.state != spec.state {
            info!(host = %id, from = %host.state, to = %spec.state, "Changing host state");
            let task = with_retry(ctx, &format!("set state of {id}"), 0, || {
                gateway.set_host_state(id, &spec.state)
            })
            .await
            .step("set host state")?;
            await_task(ctx, task).await.step("set host state")?;
            settle(ctx, SettlePoint::AfterStateChange).await?;
            host = fetch_expected(self, ctx, id, "state change").await?;
        }

        if Self::merge_appliance(spec, &mut host) {
            info!(host = %id, "Updating appliance settings");
            let host = &host;
            with_retry(ctx, &format!("update appliance of {id}"), 0, || {
                gateway.update_appliance(id, host)
            })
            .await
            .step("update appliance")?;
            settle(ctx, SettlePoint::AfterApplianceUpdate).await?;
        } else {
            debug!(host = %id, "Appliance settings already match");
        }
        Ok(())
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<Host> {
        ctx.gateway().get_host(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, current: Host) -> Result<()> {
        let gateway = ctx.gateway();

        if current.state == STATE_UNREACHABLE {
            info!(host = %id, "Host is unreachable, deleting record");
            return with_retry(ctx, &format!("delete host {id}"), 0, || gateway.delete_host(id))
                .await
                .step("delete host record");
        }

        if current.state == STATE_AVAILABLE {
            info!(host = %id, "Draining host to maintenance");
            let task = with_retry(ctx, &format!("drain host {id}"), 0, || {
                gateway.set_host_state(id, STATE_MAINTENANCE)
            })
            .await
            .step("enter maintenance")?;
            await_task(ctx, task).await.step("enter maintenance")?;
            settle(ctx, SettlePoint::AfterMaintenance).await?;
        }

        let task = with_retry(ctx, &format!("unjoin host {id}"), 0, || gateway.unjoin_host(id))
            .await
            .step("submit unjoin")?;
        await_task(ctx, task).await.step("unjoin")?;
        Ok(())
    }

    fn object_id(&self, host: &Host) -> String {
        host.hostid.clone()
    }

    fn project(&self, host: &Host) -> CallerState {
        let appliance = &host.appliance;
        Projection::new()
            .set("hostid", host.hostid.as_str())
            .set("hostname", host.hostname.as_str())
            .set("ip_address", host.ip_address.as_str())
            .set("state", host.state.as_str())
            .set("gateway_only", appliance.is_gateway())
            .set_non_empty("cluster_id", &appliance.cluster_id)
            .set_non_empty("log_level", &appliance.log_level)
            .set("max_clone_density", appliance.max_clone_density)
            .set("ntp_servers", appliance.ntp.as_str())
            .set_non_empty("timezone", &appliance.timezone)
            .build()
    }

    /// An unjoined host may linger in the host list
    fn awaits_disappearance(&self) -> bool {
        false
    }
}
