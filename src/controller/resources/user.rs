//! Realm users and groups granted a role
//!
//! The control plane does not assign user ids; the engine generates one. A
//! user is matched by realm plus username, or realm plus group name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::Kind;
use crate::client::types::User;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSpec {
    pub realm: String,
    pub username: Option<String>,
    pub groupname: Option<String>,
    pub role: String,
}

/// Who a user entry grants access to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Principal<'a> {
    User(&'a str),
    Group(&'a str),
}

impl UserSpec {
    fn principal(&self) -> Result<Principal<'_>> {
        if let Some(name) = self.username.as_deref().filter(|n| !n.is_empty()) {
            return Ok(Principal::User(name));
        }
        if let Some(name) = self.groupname.as_deref().filter(|n| !n.is_empty()) {
            return Ok(Principal::Group(name));
        }
        Err(Error::validation("username or groupname must be provided"))
    }

    fn validate(&self) -> Result<()> {
        self.principal()?;
        if self.realm.is_empty() || self.role.is_empty() {
            return Err(Error::validation("user needs a realm and a role"));
        }
        Ok(())
    }

    fn matches(&self, user: &User) -> bool {
        if !user.realm.eq_ignore_ascii_case(&self.realm) {
            return false;
        }
        match self.principal() {
            Ok(Principal::User(name)) => user.username == name,
            Ok(Principal::Group(name)) => user.group_name == name,
            Err(_) => false,
        }
    }

    fn to_remote(&self, id: String) -> Result<User> {
        let (username, group_name) = match self.principal()? {
            Principal::User(name) => (name.to_string(), String::new()),
            Principal::Group(name) => (String::new(), name.to_string()),
        };
        Ok(User {
            id,
            username,
            group_name,
            realm: self.realm.clone(),
            role: self.role.clone(),
        })
    }
}

pub struct UserResource;

#[async_trait]
impl ResourceKind for UserResource {
    type Spec = UserSpec;
    type Object = User;

    const KIND: Kind = Kind::User;

    async fn lookup_existing(&self, ctx: &ReconcileContext, spec: &UserSpec) -> Result<Option<User>> {
        spec.validate()?;
        Ok(ctx
            .gateway()
            .list_users()
            .await?
            .into_iter()
            .find(|u| spec.matches(u)))
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &UserSpec) -> Result<String> {
        let user = spec.to_remote(Uuid::new_v4().to_string())?;
        info!(id = %user.id, realm = %user.realm, role = %user.role, "Creating user");
        ctx.gateway().create_user(&user).await.step("post user")?;
        Ok(user.id)
    }

    async fn apply_delta(&self, ctx: &ReconcileContext, spec: &UserSpec, current: User) -> Result<()> {
        if current.role == spec.role {
            return Ok(());
        }
        info!(id = %current.id, from = %current.role, to = %spec.role, "Changing user role");
        let updated = spec.to_remote(current.id)?;
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("update user {}", updated.id), 0, || {
            gateway.update_user(&updated)
        })
        .await
        .step("put user")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<User> {
        ctx.gateway().get_user(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: User) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete user {id}"), 0, || gateway.delete_user(id)).await
    }

    fn object_id(&self, user: &User) -> String {
        user.id.clone()
    }

    fn project(&self, user: &User) -> CallerState {
        let projection = Projection::new()
            .set("id", user.id.as_str())
            .set("realm", user.realm.as_str())
            .set("role", user.role.as_str());
        if !user.username.is_empty() {
            projection.set("username", user.username.as_str()).build()
        } else {
            projection.set_non_empty("groupname", &user.group_name).build()
        }
    }
}
