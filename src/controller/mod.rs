//! Reconciliation engine for control-plane objects
//!
//! This module contains the generic create/adopt/update/delete sequencing,
//! the retry and task-polling loops it runs on, and one resource kind per
//! managed object type.

pub mod classify;
pub mod context;
pub mod engine;
pub mod projector;
pub mod resources;
pub mod retry;
pub mod settle;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{classify, classify_status, ErrorClass, NotFoundExt};
pub use context::ReconcileContext;
pub use engine::{
    DeleteMode, Engine, ReadOutcome, ReconciliationResult, ResourceHandle, ResourceKind,
};
pub use projector::{CallerState, Projection};
pub use resources::{
    DesiredSpec, DiskSource, DiskSpec, ExternalGuestSpec, GatewayHostSpec, GuestPoolSpec,
    HostIscsiSpec, HostNetworkSpec, HostSpec, Kind, LicenseSpec, ProfileSpec, ReadyMethod,
    RealmSpec, Secret, SharedStorageSpec, StoragePoolSpec, TemplateSpec, UserSpec,
    VirtualMachineSpec,
};
pub use retry::{with_retry, RetryPolicy};
pub use settle::{settle, SettlePoint, SettlePolicy};
pub use task::{await_task, poll_until, PollPolicy, Probe};
