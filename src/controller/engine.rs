//! Generic reconciliation engine
//!
//! Every resource kind implements [`ResourceKind`]; the engine owns the
//! sequencing that is common to all of them:
//!
//! - reconcile with a known id: fetch, apply the delta, re-read. A vanished
//!   object falls through to the create path.
//! - reconcile without an id: look up by natural key and adopt on a match,
//!   otherwise create, settle, apply the delta and run the convergence read.
//!   NotFound on either read after a create is fatal.
//! - delete: adopted objects are only detached; owned objects are deleted and
//!   then polled until the control plane reports them gone.
//! - read: project the current object, or report it gone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::classify::NotFoundExt;
use super::context::ReconcileContext;
use super::projector::CallerState;
use super::resources::{self, DesiredSpec, Kind};
use super::retry::with_retry;
use super::settle::{settle, SettlePoint};
use super::task::{poll_until, Probe};
use crate::client::ObjectGateway;
use crate::config::EngineConfig;
use crate::error::{Error, Result, StepContext};

/// What a delete of an owned object does remotely
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteMode {
    Destroy,
    /// Never removed remotely; delete only drops management
    DetachOnly,
}

/// One closed-set member of the resources the engine can reconcile
#[async_trait]
pub trait ResourceKind: Send + Sync {
    type Spec: Send + Sync;
    type Object: Send + Sync;

    const KIND: Kind;

    /// Find an object matching the spec's natural key
    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &Self::Spec,
    ) -> Result<Option<Self::Object>>;

    /// Create the object and return its id once the control plane has it
    async fn create(&self, ctx: &ReconcileContext, spec: &Self::Spec) -> Result<String>;

    /// Bring `current` in line with `spec`; a no-op when nothing differs
    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &Self::Spec,
        current: Self::Object,
    ) -> Result<()>;

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<Self::Object>;

    async fn delete(&self, ctx: &ReconcileContext, id: &str, current: Self::Object)
        -> Result<()>;

    fn object_id(&self, object: &Self::Object) -> String;

    fn project(&self, object: &Self::Object) -> CallerState;

    /// Check the first read after a create, before any delta is applied
    fn verify_created(&self, _object: &Self::Object) -> Result<()> {
        Ok(())
    }

    /// Id the object answers to once `spec` has been applied to it
    fn id_after_update(&self, _spec: &Self::Spec, id: &str) -> String {
        id.to_string()
    }

    fn delete_mode(&self) -> DeleteMode {
        DeleteMode::Destroy
    }

    /// Whether delete polls until the object reads as NotFound
    fn awaits_disappearance(&self) -> bool {
        true
    }
}

/// Locally stored identity of a managed object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: Kind,
    pub id: String,
    /// The object existed before management started
    #[serde(default)]
    pub adopted: bool,
}

impl ResourceHandle {
    pub fn new(kind: Kind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            adopted: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub kind: Kind,
    pub id: String,
    pub state: CallerState,
    pub adopted: bool,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationResult {
    pub fn handle(&self) -> ResourceHandle {
        ResourceHandle {
            kind: self.kind,
            id: self.id.clone(),
            adopted: self.adopted,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReadOutcome {
    Present(CallerState),
    /// The object no longer exists; the caller should drop its handle
    Gone,
}

impl ReadOutcome {
    pub fn is_gone(&self) -> bool {
        matches!(self, ReadOutcome::Gone)
    }
}

macro_rules! with_resource {
    ($kind:expr, $r:ident => $body:expr) => {
        match $kind {
            Kind::Host => {
                let $r = &resources::host::HostResource;
                $body
            }
            Kind::StoragePool => {
                let $r = &resources::storage_pool::StoragePoolResource;
                $body
            }
            Kind::Disk => {
                let $r = &resources::disk::DiskResource;
                $body
            }
            Kind::GuestPool => {
                let $r = &resources::guest_pool::GuestPoolResource;
                $body
            }
            Kind::VirtualMachine => {
                let $r = &resources::virtual_machine::VirtualMachineResource;
                $body
            }
            Kind::Template => {
                let $r = &resources::template::TemplateResource;
                $body
            }
            Kind::Realm => {
                let $r = &resources::realm::RealmResource;
                $body
            }
            Kind::User => {
                let $r = &resources::user::UserResource;
                $body
            }
            Kind::Profile => {
                let $r = &resources::profile::ProfileResource;
                $body
            }
            Kind::GatewayHost => {
                let $r = &resources::gateway_host::GatewayHostResource;
                $body
            }
            Kind::License => {
                let $r = &resources::license::LicenseResource;
                $body
            }
            Kind::SharedStorage => {
                let $r = &resources::shared_storage::SharedStorageResource;
                $body
            }
            Kind::HostNetwork => {
                let $r = &resources::host_network::HostNetworkResource;
                $body
            }
            Kind::HostIscsi => {
                let $r = &resources::host_iscsi::HostIscsiResource;
                $body
            }
            Kind::ExternalGuest => {
                let $r = &resources::external_guest::ExternalGuestResource;
                $body
            }
        }
    };
}

/// Entry point for callers: reconcile, delete and read any supported kind
pub struct Engine {
    gateway: Arc<dyn ObjectGateway>,
    config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(gateway: Arc<dyn ObjectGateway>, config: EngineConfig) -> Self {
        Self {
            gateway,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn context(
        &self,
        cancel: &CancellationToken,
        operation: String,
        budget: std::time::Duration,
    ) -> ReconcileContext {
        ReconcileContext::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.config),
            cancel.clone(),
            operation,
            budget,
        )
    }

    /// Converge the remote object described by `spec`
    #[instrument(skip_all, fields(kind = %spec.kind(), id = existing.map(|h| h.id.as_str()).unwrap_or("")))]
    pub async fn reconcile(
        &self,
        spec: &DesiredSpec,
        existing: Option<&ResourceHandle>,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationResult> {
        let kind = spec.kind();
        if let Some(handle) = existing {
            if handle.kind != kind {
                return Err(Error::validation(format!(
                    "handle for {} {} cannot reconcile a {} spec",
                    handle.kind, handle.id, kind
                )));
            }
        }

        let budget = if existing.is_some() {
            self.config.timeouts.update
        } else {
            self.config.timeouts.create
        };
        let ctx = self.context(cancel, format!("reconcile {kind}"), budget);

        match spec {
            DesiredSpec::Host(s) => {
                reconcile_kind(&resources::host::HostResource, &ctx, s, existing).await
            }
            DesiredSpec::StoragePool(s) => {
                reconcile_kind(&resources::storage_pool::StoragePoolResource, &ctx, s, existing)
                    .await
            }
            DesiredSpec::Disk(s) => {
                reconcile_kind(&resources::disk::DiskResource, &ctx, s, existing).await
            }
            DesiredSpec::GuestPool(s) => {
                reconcile_kind(&resources::guest_pool::GuestPoolResource, &ctx, s, existing).await
            }
            DesiredSpec::VirtualMachine(s) => {
                reconcile_kind(
                    &resources::virtual_machine::VirtualMachineResource,
                    &ctx,
                    s,
                    existing,
                )
                .await
            }
            DesiredSpec::Template(s) => {
                reconcile_kind(&resources::template::TemplateResource, &ctx, s, existing).await
            }
            DesiredSpec::Realm(s) => {
                reconcile_kind(&resources::realm::RealmResource, &ctx, s, existing).await
            }
            DesiredSpec::User(s) => {
                reconcile_kind(&resources::user::UserResource, &ctx, s, existing).await
            }
            DesiredSpec::Profile(s) => {
                reconcile_kind(&resources::profile::ProfileResource, &ctx, s, existing).await
            }
            DesiredSpec::GatewayHost(s) => {
                reconcile_kind(&resources::gateway_host::GatewayHostResource, &ctx, s, existing)
                    .await
            }
            DesiredSpec::License(s) => {
                reconcile_kind(&resources::license::LicenseResource, &ctx, s, existing).await
            }
            DesiredSpec::SharedStorage(s) => {
                reconcile_kind(
                    &resources::shared_storage::SharedStorageResource,
                    &ctx,
                    s,
                    existing,
                )
                .await
            }
            DesiredSpec::HostNetwork(s) => {
                reconcile_kind(&resources::host_network::HostNetworkResource, &ctx, s, existing)
                    .await
            }
            DesiredSpec::HostIscsi(s) => {
                reconcile_kind(&resources::host_iscsi::HostIscsiResource, &ctx, s, existing).await
            }
            DesiredSpec::ExternalGuest(s) => {
                reconcile_kind(
                    &resources::external_guest::ExternalGuestResource,
                    &ctx,
                    s,
                    existing,
                )
                .await
            }
        }
    }

    /// Remove (or, for adopted objects, detach from) a managed object
    #[instrument(skip_all, fields(kind = %handle.kind, id = %handle.id, adopted = handle.adopted))]
    pub async fn delete(&self, handle: &ResourceHandle, cancel: &CancellationToken) -> Result<()> {
        let ctx = self.context(
            cancel,
            format!("delete {} {}", handle.kind, handle.id),
            self.config.timeouts.delete,
        );
        with_resource!(handle.kind, r => delete_kind(r, &ctx, handle).await)
    }

    /// Current projected state, or `Gone` when the object no longer exists
    #[instrument(skip_all, fields(kind = %handle.kind, id = %handle.id))]
    pub async fn read(
        &self,
        handle: &ResourceHandle,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome> {
        let ctx = self.context(
            cancel,
            format!("read {} {}", handle.kind, handle.id),
            self.config.timeouts.read,
        );
        with_resource!(handle.kind, r => read_kind(r, &ctx, &handle.id).await)
    }
}

pub(crate) async fn fetch_retrying<R: ResourceKind>(
    r: &R,
    ctx: &ReconcileContext,
    id: &str,
) -> Result<R::Object> {
    with_retry(ctx, &format!("read {} {id}", R::KIND), 0, || r.fetch(ctx, id)).await
}

/// Read an object that must exist because this call just created or changed it
pub(crate) async fn fetch_expected<R: ResourceKind>(
    r: &R,
    ctx: &ReconcileContext,
    id: &str,
    step: &'static str,
) -> Result<R::Object> {
    match fetch_retrying(r, ctx, id).await {
        Err(e) if e.is_not_found() => {
            warn!(kind = %R::KIND, id = %id, step, "Object vanished");
            Err(Error::Vanished {
                kind: R::KIND,
                id: id.to_string(),
                step,
            })
        }
        other => other,
    }
}

fn result<R: ResourceKind>(r: &R, object: &R::Object, adopted: bool) -> ReconciliationResult {
    ReconciliationResult {
        kind: R::KIND,
        id: r.object_id(object),
        state: r.project(object),
        adopted,
        reconciled_at: Utc::now(),
    }
}

async fn reconcile_kind<R: ResourceKind>(
    r: &R,
    ctx: &ReconcileContext,
    spec: &R::Spec,
    existing: Option<&ResourceHandle>,
) -> Result<ReconciliationResult> {
    let kind = R::KIND;

    if let Some(handle) = existing {
        match fetch_retrying(r, ctx, &handle.id)
            .await
            .or_absent()
            .step(format!("read {kind} {}", handle.id))?
        {
            Some(current) => {
                debug!(kind = %kind, id = %handle.id, "Applying delta to managed object");
                r.apply_delta(ctx, spec, current)
                    .await
                    .step(format!("update {kind} {}", handle.id))?;
                let id = r.id_after_update(spec, &handle.id);
                let converged = fetch_expected(r, ctx, &id, "update").await?;
                return Ok(result(r, &converged, handle.adopted));
            }
            None => {
                warn!(kind = %kind, id = %handle.id, "Managed object is gone, recreating");
            }
        }
    }

    if let Some(found) = with_retry(ctx, &format!("look up {kind}"), 0, || {
        r.lookup_existing(ctx, spec)
    })
    .await
    .step(format!("look up {kind}"))?
    {
        let adopted = result(r, &found, true);
        info!(kind = %kind, id = %adopted.id, "Adopted existing object");
        return Ok(adopted);
    }

    info!(kind = %kind, "Creating");
    let id = r.create(ctx, spec).await.step(format!("create {kind}"))?;
    settle(ctx, SettlePoint::AfterCreate)
        .await
        .step(format!("create {kind} {id}"))?;

    let current = fetch_expected(r, ctx, &id, "create").await?;
    r.verify_created(&current)
        .step(format!("create {kind} {id}"))?;
    r.apply_delta(ctx, spec, current)
        .await
        .step(format!("configure {kind} {id}"))?;
    let converged = fetch_expected(r, ctx, &id, "create").await?;

    let created = result(r, &converged, false);
    info!(kind = %kind, id = %created.id, "Created");
    Ok(created)
}

async fn delete_kind<R: ResourceKind>(
    r: &R,
    ctx: &ReconcileContext,
    handle: &ResourceHandle,
) -> Result<()> {
    let kind = R::KIND;
    let id = handle.id.as_str();

    if handle.adopted || r.delete_mode() == DeleteMode::DetachOnly {
        info!(kind = %kind, id = %id, "Detaching without remote delete");
        return Ok(());
    }

    let Some(current) = fetch_retrying(r, ctx, id)
        .await
        .or_absent()
        .step(format!("read {kind} {id}"))?
    else {
        info!(kind = %kind, id = %id, "Already gone");
        return Ok(());
    };

    r.delete(ctx, id, current)
        .await
        .step(format!("delete {kind} {id}"))?;

    if r.awaits_disappearance() {
        poll_until(ctx, &format!("wait for {kind} {id} removal"), || async move {
            match r.fetch(ctx, id).await {
                Ok(_) => Ok(Probe::Pending(format!("{kind} {id} still present"))),
                Err(e) if e.is_not_found() => Ok(Probe::Ready(())),
                Err(e) => Err(e),
            }
        })
        .await
        .step(format!("delete {kind} {id}"))?;
    }

    info!(kind = %kind, id = %id, "Deleted");
    Ok(())
}

async fn read_kind<R: ResourceKind>(r: &R, ctx: &ReconcileContext, id: &str) -> Result<ReadOutcome> {
    match fetch_retrying(r, ctx, id)
        .await
        .or_absent()
        .step(format!("read {} {id}", R::KIND))?
    {
        Some(object) => Ok(ReadOutcome::Present(r.project(&object))),
        None => {
            debug!(kind = %R::KIND, id = %id, "Object is gone");
            Ok(ReadOutcome::Gone)
        }
    }
}
