//! hive-reconciler: declarative reconciliation for Hive Fabric clusters
//!
//! This crate converges hosts, storage, guest pools, virtual machines and
//! directory objects on a Hive Fabric control plane towards a desired spec.
//! It talks to the control plane's REST API, absorbs the API's asynchronous
//! tasks and eventual consistency, and reports the resulting state.

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod telemetry;

pub use crate::client::{ConnectionPool, ObjectGateway, RestClient};
pub use crate::config::{ConnectionSpec, EngineConfig};
pub use crate::controller::{
    DesiredSpec, Engine, Kind, ReadOutcome, ReconciliationResult, ResourceHandle,
};
pub use crate::error::{Error, Result};
