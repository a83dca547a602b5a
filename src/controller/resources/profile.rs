//! Guest profiles: timezone, domain join and backup settings shared by pools

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::guest_pool::{project_backup, BackupSpec};
use super::{Kind, Secret};
use crate::client::types::{AdConfig, Backup, Profile};
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdConfigSpec {
    pub domain: String,
    pub username: String,
    pub password: Secret,
    pub user_group: String,
    pub ou: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSpec {
    pub name: String,
    pub timezone: String,
    pub ad_config: Option<AdConfigSpec>,
    pub backup: Option<BackupSpec>,
}

impl Default for ProfileSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            timezone: "disabled".to_string(),
            ad_config: None,
            backup: None,
        }
    }
}

impl ProfileSpec {
    fn to_remote(&self) -> Profile {
        Profile {
            id: String::new(),
            name: self.name.clone(),
            timezone: self.timezone.clone(),
            ad_config: self.ad_config.as_ref().map(|ad| AdConfig {
                domain: ad.domain.clone(),
                username: ad.username.clone(),
                password: ad.password.expose().to_string(),
                user_group: ad.user_group.clone(),
                ou: ad.ou.clone(),
            }),
            backup: self.backup.as_ref().map(Backup::from),
        }
    }

    /// Compare everything but the write-only domain password
    fn differs(&self, current: &Profile) -> bool {
        let mut want = self.to_remote();
        want.id = current.id.clone();
        if let (Some(want_ad), Some(have_ad)) = (want.ad_config.as_mut(), current.ad_config.as_ref())
        {
            want_ad.password = have_ad.password.clone();
        }
        want != *current
    }
}

pub struct ProfileResource;

#[async_trait]
impl ResourceKind for ProfileResource {
    type Spec = ProfileSpec;
    type Object = Profile;

    const KIND: Kind = Kind::Profile;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &ProfileSpec,
    ) -> Result<Option<Profile>> {
        if spec.name.is_empty() {
            return Err(Error::validation("profile name must be set"));
        }
        ctx.gateway().find_profile(&spec.name).await
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &ProfileSpec) -> Result<String> {
        let gateway = ctx.gateway();
        info!(profile = %spec.name, "Creating profile");
        gateway
            .create_profile(&spec.to_remote())
            .await
            .step("post profile")?;

        gateway
            .find_profile(&spec.name)
            .await
            .step("resolve id")?
            .map(|p| p.id)
            .ok_or_else(|| Error::Vanished {
                kind: Kind::Profile,
                id: spec.name.clone(),
                step: "create",
            })
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &ProfileSpec,
        current: Profile,
    ) -> Result<()> {
        if !spec.differs(&current) {
            return Ok(());
        }
        info!(profile = %current.id, "Updating profile");
        let mut updated = spec.to_remote();
        updated.id = current.id;
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("update profile {}", updated.id), 0, || {
            gateway.update_profile(&updated)
        })
        .await
        .step("put profile")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<Profile> {
        ctx.gateway().get_profile(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: Profile) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete profile {id}"), 0, || gateway.delete_profile(id)).await
    }

    fn object_id(&self, profile: &Profile) -> String {
        profile.id.clone()
    }

    fn project(&self, profile: &Profile) -> CallerState {
        Projection::new()
            .set("id", profile.id.as_str())
            .set("name", profile.name.as_str())
            .set("timezone", profile.timezone.as_str())
            .nest(
                "ad_config",
                profile.ad_config.as_ref().map(|ad| {
                    Projection::new()
                        .set("domain", ad.domain.as_str())
                        .set_non_empty("username", &ad.username)
                        .set("user_group", ad.user_group.as_str())
                        .set_non_empty("ou", &ad.ou)
                }),
            )
            .nest("backup", project_backup(profile.backup.as_ref()))
            .build()
    }
}
