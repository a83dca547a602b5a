//! iSCSI sessions from a host to a storage target
//!
//! The portal is resolved through discovery first, since the target may
//! answer on a different address than the one configured. An existing
//! session to the same target is adopted instead of logging in twice.
//! Sessions have no mutable fields; a changed target needs a new object.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Kind, Secret};
use crate::client::types::{IscsiLogin, IscsiSession};
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostIscsiSpec {
    pub host_id: String,
    /// `address[:port]` to run discovery against
    pub portal: String,
    pub target: String,
    /// CHAP credentials; both must be set for CHAP to be used
    pub username: String,
    pub password: Secret,
}

impl HostIscsiSpec {
    fn validate(&self) -> Result<()> {
        if self.host_id.is_empty() || self.portal.is_empty() || self.target.is_empty() {
            return Err(Error::validation(
                "iSCSI session needs a host_id, a portal and a target",
            ));
        }
        if self.portal.contains('/') {
            return Err(Error::validation(format!(
                "iSCSI portal {} must not contain '/'",
                self.portal
            )));
        }
        Ok(())
    }

    fn login(&self, portal: &str) -> IscsiLogin {
        let chap = !self.username.is_empty() && !self.password.is_empty();
        IscsiLogin {
            portal: portal.to_string(),
            target: self.target.clone(),
            auth_method: if chap { "CHAP" } else { "None" }.to_string(),
            username: if chap { self.username.clone() } else { String::new() },
            password: if chap {
                self.password.expose().to_string()
            } else {
                String::new()
            },
        }
    }
}

/// A session together with the host that holds it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IscsiAttachment {
    pub host_id: String,
    pub session: IscsiSession,
}

fn session_id(host_id: &str, session: &IscsiSession) -> String {
    format!("{host_id}/{}/{}", session.portal, session.target)
}

fn split_id(id: &str) -> Result<(&str, &str, &str)> {
    let mut parts = id.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(portal), Some(target))
            if !host.is_empty() && !portal.is_empty() && !target.is_empty() =>
        {
            Ok((host, portal, target))
        }
        _ => Err(Error::validation(format!("malformed iSCSI session id {id}"))),
    }
}

pub struct HostIscsiResource;

impl HostIscsiResource {
    /// The portal the target actually answers on
    async fn resolve_portal(ctx: &ReconcileContext, spec: &HostIscsiSpec) -> Result<String> {
        let targets = match ctx.gateway().iscsi_discover(&spec.host_id, &spec.portal).await {
            Err(e) if e.is_not_found() => {
                return Err(Error::validation(format!("host {} not found", spec.host_id)))
            }
            other => other.step("discover targets")?,
        };
        if targets.is_empty() {
            return Err(Error::unexpected(format!(
                "no iSCSI targets found at {}",
                spec.portal
            )));
        }
        let portal = targets
            .into_iter()
            .find(|t| t.target == spec.target && !t.portal.is_empty())
            .map(|t| t.portal)
            .unwrap_or_else(|| spec.portal.clone());
        debug!(configured = %spec.portal, resolved = %portal, "Resolved iSCSI portal");
        Ok(portal)
    }
}

#[async_trait]
impl ResourceKind for HostIscsiResource {
    type Spec = HostIscsiSpec;
    type Object = IscsiAttachment;

    const KIND: Kind = Kind::HostIscsi;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &HostIscsiSpec,
    ) -> Result<Option<IscsiAttachment>> {
        spec.validate()?;
        let portal = Self::resolve_portal(ctx, spec).await?;
        let sessions = ctx
            .gateway()
            .iscsi_sessions(&spec.host_id, &portal, &spec.target)
            .await?;
        Ok(sessions
            .into_iter()
            .find(|s| s.target == spec.target)
            .map(|session| IscsiAttachment {
                host_id: spec.host_id.clone(),
                session,
            }))
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &HostIscsiSpec) -> Result<String> {
        let portal = Self::resolve_portal(ctx, spec).await?;
        let login = spec.login(&portal);
        info!(host = %spec.host_id, portal = %portal, target = %spec.target, auth = %login.auth_method, "Logging in to iSCSI target");
        let sessions = ctx
            .gateway()
            .iscsi_login(&spec.host_id, &login)
            .await
            .step("login")?;
        let session = sessions
            .into_iter()
            .find(|s| s.target == spec.target)
            .ok_or_else(|| {
                Error::unexpected(format!("no iSCSI session after login to {}", spec.target))
            })?;
        Ok(session_id(&spec.host_id, &session))
    }

    async fn apply_delta(
        &self,
        _ctx: &ReconcileContext,
        spec: &HostIscsiSpec,
        current: IscsiAttachment,
    ) -> Result<()> {
        if current.host_id != spec.host_id || current.session.target != spec.target {
            return Err(Error::validation(format!(
                "iSCSI session {} cannot move to {} on {}; delete it and create a new one",
                session_id(&current.host_id, &current.session),
                spec.target,
                spec.host_id
            )));
        }
        Ok(())
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<IscsiAttachment> {
        let (host_id, portal, target) = split_id(id)?;
        let session = ctx
            .gateway()
            .iscsi_sessions(host_id, portal, target)
            .await?
            .into_iter()
            .find(|s| s.target == target)
            .ok_or_else(|| Error::NotFound {
                kind: Kind::HostIscsi,
                id: id.to_string(),
            })?;
        Ok(IscsiAttachment {
            host_id: host_id.to_string(),
            session,
        })
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, current: IscsiAttachment) -> Result<()> {
        let gateway = ctx.gateway();
        let host_id = current.host_id.as_str();
        let session = &current.session;
        info!(host = %host_id, target = %session.target, "Logging out of iSCSI target");
        with_retry(ctx, &format!("log out {id}"), 0, || {
            gateway.iscsi_logout(host_id, &session.portal, &session.target)
        })
        .await
    }

    fn object_id(&self, attachment: &IscsiAttachment) -> String {
        session_id(&attachment.host_id, &attachment.session)
    }

    fn project(&self, attachment: &IscsiAttachment) -> CallerState {
        let session = &attachment.session;
        Projection::new()
            .set("host_id", attachment.host_id.as_str())
            .set("portal", session.portal.as_str())
            .set("target", session.target.as_str())
            .set_non_empty("device_name", &session.block_device.name)
            .set_non_empty("device_path", &session.block_device.path)
            .build()
    }
}
