//! Active directory realms, keyed by name

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Kind, Secret};
use crate::client::types::{Realm, ServiceAccount};
use crate::controller::classify::NotFoundExt;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmSpec {
    /// NetBIOS name
    pub name: String,
    pub fqdn: String,
    #[serde(rename = "tls")]
    pub force_tls: bool,
    pub site: String,
    pub alias: String,
    pub verified: bool,
    /// Service account used to query the directory
    pub username: String,
    pub password: Secret,
}

impl RealmSpec {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.fqdn.is_empty() {
            return Err(Error::validation("realm needs a name and an fqdn"));
        }
        Ok(())
    }

    fn to_remote(&self) -> Realm {
        Realm {
            name: self.name.clone(),
            fqdn: self.fqdn.clone(),
            site: self.site.clone(),
            alias: self.alias.clone(),
            verified: self.verified,
            force_tls: self.force_tls,
            service_account: (!self.username.is_empty()).then(|| ServiceAccount {
                username: self.username.clone(),
                password: self.password.expose().to_string(),
            }),
        }
    }

    /// The password is write-only and never compared
    fn differs(&self, current: &Realm) -> bool {
        let account = current
            .service_account
            .as_ref()
            .map(|a| a.username.as_str())
            .unwrap_or("");
        current.fqdn != self.fqdn
            || current.site != self.site
            || current.alias != self.alias
            || current.verified != self.verified
            || current.force_tls != self.force_tls
            || account != self.username
    }
}

pub struct RealmResource;

#[async_trait]
impl ResourceKind for RealmResource {
    type Spec = RealmSpec;
    type Object = Realm;

    const KIND: Kind = Kind::Realm;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &RealmSpec,
    ) -> Result<Option<Realm>> {
        spec.validate()?;
        ctx.gateway().get_realm(&spec.name).await.or_absent()
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &RealmSpec) -> Result<String> {
        info!(realm = %spec.name, fqdn = %spec.fqdn, "Creating realm");
        ctx.gateway()
            .create_realm(&spec.to_remote())
            .await
            .step("post realm")?;
        Ok(spec.name.clone())
    }

    async fn apply_delta(&self, ctx: &ReconcileContext, spec: &RealmSpec, current: Realm) -> Result<()> {
        if !spec.differs(&current) {
            return Ok(());
        }
        info!(realm = %spec.name, "Updating realm");
        let gateway = ctx.gateway();
        let updated = spec.to_remote();
        with_retry(ctx, &format!("update realm {}", spec.name), 0, || {
            gateway.update_realm(&updated)
        })
        .await
        .step("put realm")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<Realm> {
        ctx.gateway().get_realm(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: Realm) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete realm {id}"), 0, || gateway.delete_realm(id)).await
    }

    fn object_id(&self, realm: &Realm) -> String {
        realm.name.clone()
    }

    fn project(&self, realm: &Realm) -> CallerState {
        Projection::new()
            .set("name", realm.name.as_str())
            .set("fqdn", realm.fqdn.as_str())
            .set("tls", realm.force_tls)
            .set("verified", realm.verified)
            .set_non_empty("site", &realm.site)
            .set_non_empty("alias", &realm.alias)
            .set_opt(
                "username",
                realm.service_account.as_ref().map(|a| a.username.as_str()),
            )
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> RealmSpec {
        RealmSpec {
            name: "CORP".to_string(),
            fqdn: "corp.example.com".to_string(),
            username: "svc-hive".to_string(),
            password: Secret::from("hunter2"),
            ..Default::default()
        }
    }

    #[test]
    fn test_password_change_is_not_drift() {
        let mut remote = spec().to_remote();
        if let Some(account) = remote.service_account.as_mut() {
            account.password.clear();
        }
        assert!(!spec().differs(&remote));

        remote.force_tls = true;
        assert!(spec().differs(&remote));
    }

    #[test]
    fn test_no_service_account_without_username() {
        let spec = RealmSpec {
            name: "CORP".to_string(),
            fqdn: "corp.example.com".to_string(),
            ..Default::default()
        };
        assert!(spec.to_remote().service_account.is_none());
        assert!(!spec.differs(&spec.to_remote()));
    }

    #[test]
    fn test_projection_omits_password() {
        let state = RealmResource.project(&spec().to_remote());
        assert_eq!(state["name"], json!("CORP"));
        assert_eq!(state["username"], json!("svc-hive"));
        assert_eq!(state["tls"], json!(false));
        assert!(!state.values().any(|v| v == &json!("hunter2")));
    }
}
