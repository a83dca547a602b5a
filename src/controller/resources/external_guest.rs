//! Guests that run outside the cluster but are brokered by it
//!
//! An external guest is registered once under its name. The control plane
//! offers no update for a registration, so a changed spec is rejected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::guest_pool::project_broker;
use super::Kind;
use crate::client::types::{BrokerOptions, ExternalGuest, Guest};
use crate::controller::classify::NotFoundExt;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalGuestSpec {
    pub name: String,
    /// Hostname or ip the broker connects to
    pub address: String,
    pub username: String,
    pub realm: String,
    pub profile_id: String,
    pub ad_group: Option<String>,
    pub os: Option<String>,
    pub disable_port_check: bool,
    pub broker: Option<BrokerOptions>,
}

impl ExternalGuestSpec {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.address.is_empty() {
            return Err(Error::validation("external guest needs a name and an address"));
        }
        if self.username.is_empty() || self.realm.is_empty() || self.profile_id.is_empty() {
            return Err(Error::validation(format!(
                "external guest {} needs a username, a realm and a profile_id",
                self.name
            )));
        }
        Ok(())
    }

    fn to_remote(&self) -> ExternalGuest {
        ExternalGuest {
            guest_name: self.name.clone(),
            address: self.address.clone(),
            username: self.username.clone(),
            ad_group: self.ad_group.clone().unwrap_or_default(),
            profile_id: self.profile_id.clone(),
            realm: self.realm.clone(),
            os: self.os.clone().unwrap_or_default(),
            disable_port_check: self.disable_port_check,
            broker_options: self.broker.clone().unwrap_or_default(),
        }
    }

    /// Fields of `current` that no longer match; unset options are ignored
    fn drift(&self, current: &Guest) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if current.address != self.address {
            fields.push("address");
        }
        if current.username != self.username {
            fields.push("username");
        }
        if !current.realm.eq_ignore_ascii_case(&self.realm) {
            fields.push("realm");
        }
        if current.profile_id != self.profile_id {
            fields.push("profile_id");
        }
        if self.ad_group.as_ref().is_some_and(|g| *g != current.ad_group) {
            fields.push("ad_group");
        }
        if self.os.as_ref().is_some_and(|os| *os != current.os) {
            fields.push("os");
        }
        if current.disable_port_check != self.disable_port_check {
            fields.push("disable_port_check");
        }
        if self.broker.is_some() && current.broker_options != self.broker {
            fields.push("broker");
        }
        fields
    }
}

pub struct ExternalGuestResource;

#[async_trait]
impl ResourceKind for ExternalGuestResource {
    type Spec = ExternalGuestSpec;
    type Object = Guest;

    const KIND: Kind = Kind::ExternalGuest;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &ExternalGuestSpec,
    ) -> Result<Option<Guest>> {
        spec.validate()?;
        ctx.gateway().get_guest(&spec.name).await.or_absent()
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &ExternalGuestSpec) -> Result<String> {
        info!(guest = %spec.name, address = %spec.address, "Registering external guest");
        ctx.gateway()
            .create_external_guest(&spec.to_remote())
            .await
            .step("post external guest")?;
        Ok(spec.name.clone())
    }

    async fn apply_delta(
        &self,
        _ctx: &ReconcileContext,
        spec: &ExternalGuestSpec,
        current: Guest,
    ) -> Result<()> {
        let drift = spec.drift(&current);
        if drift.is_empty() {
            return Ok(());
        }
        Err(Error::validation(format!(
            "external guest {} cannot change {} in place; delete it and register it again",
            spec.name,
            drift.join(", ")
        )))
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<Guest> {
        ctx.gateway().get_guest(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: Guest) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete guest {id}"), 0, || gateway.delete_guest(id)).await
    }

    fn object_id(&self, guest: &Guest) -> String {
        guest.name.clone()
    }

    fn project(&self, guest: &Guest) -> CallerState {
        Projection::new()
            .set("name", guest.name.as_str())
            .set("address", guest.address.as_str())
            .set("username", guest.username.as_str())
            .set("realm", guest.realm.as_str())
            .set("profile_id", guest.profile_id.as_str())
            .set_non_empty("ad_group", &guest.ad_group)
            .set_non_empty("os", &guest.os)
            .set("disable_port_check", guest.disable_port_check)
            .set_non_empty("state", &guest.state)
            .nest("broker", project_broker(guest.broker_options.as_ref()))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::types::BrokerConnection;
    use serde_json::json;

    fn spec() -> ExternalGuestSpec {
        ExternalGuestSpec {
            name: "WORKSTATION1".to_string(),
            address: "ws1.corp.example.com".to_string(),
            username: "jdoe".to_string(),
            realm: "CORP".to_string(),
            profile_id: "prof-1".to_string(),
            ..Default::default()
        }
    }

    fn registered(spec: &ExternalGuestSpec) -> Guest {
        let body = spec.to_remote();
        Guest {
            name: body.guest_name,
            address: body.address,
            username: body.username,
            realm: body.realm,
            profile_id: body.profile_id,
            ad_group: body.ad_group,
            os: "win10".to_string(),
            broker_options: Some(body.broker_options),
            ..Default::default()
        }
    }

    #[test]
    fn test_unset_options_are_not_drift() {
        let spec = spec();
        assert!(spec.drift(&registered(&spec)).is_empty());
    }

    #[test]
    fn test_drift_names_changed_fields() {
        let mut changed = spec();
        changed.address = "ws2.corp.example.com".to_string();
        changed.os = Some("win11".to_string());
        assert_eq!(changed.drift(&registered(&spec())), vec!["address", "os"]);
    }

    #[test]
    fn test_realm_comparison_ignores_case() {
        let mut current = registered(&spec());
        current.realm = "corp".to_string();
        assert!(spec().drift(&current).is_empty());
    }

    #[test]
    fn test_projection_includes_broker_connections() {
        let mut spec = spec();
        spec.broker = Some(BrokerOptions {
            default_connection: "rdp".to_string(),
            connections: vec![BrokerConnection {
                name: "rdp".to_string(),
                port: 3389,
                protocol: "rdp".to_string(),
                ..Default::default()
            }],
        });
        let state = ExternalGuestResource.project(&registered(&spec));
        assert_eq!(state["name"], json!("WORKSTATION1"));
        assert_eq!(state["broker"]["connections"][0]["port"], json!(3389));
        assert!(!state.contains_key("ad_group"));
    }
}
