//! Resource kinds managed by the engine
//!
//! Each submodule holds the desired spec for one kind and its
//! [`ResourceKind`](super::engine::ResourceKind) implementation.

pub mod disk;
pub mod external_guest;
pub mod gateway_host;
pub mod guest_pool;
pub mod host;
pub mod host_iscsi;
pub mod host_network;
pub mod license;
pub mod profile;
pub mod realm;
pub mod shared_storage;
pub mod storage_pool;
pub mod template;
pub mod user;
pub mod virtual_machine;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use disk::{DiskSource, DiskSpec};
pub use external_guest::ExternalGuestSpec;
pub use gateway_host::GatewayHostSpec;
pub use guest_pool::GuestPoolSpec;
pub use host::HostSpec;
pub use host_iscsi::HostIscsiSpec;
pub use host_network::HostNetworkSpec;
pub use license::LicenseSpec;
pub use profile::ProfileSpec;
pub use realm::RealmSpec;
pub use shared_storage::SharedStorageSpec;
pub use storage_pool::StoragePoolSpec;
pub use template::TemplateSpec;
pub use user::UserSpec;
pub use virtual_machine::{ReadyMethod, VirtualMachineSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Host,
    StoragePool,
    Disk,
    GuestPool,
    VirtualMachine,
    Template,
    Realm,
    User,
    Profile,
    GatewayHost,
    License,
    SharedStorage,
    HostNetwork,
    HostIscsi,
    ExternalGuest,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Host => "host",
            Kind::StoragePool => "storage pool",
            Kind::Disk => "disk",
            Kind::GuestPool => "guest pool",
            Kind::VirtualMachine => "virtual machine",
            Kind::Template => "template",
            Kind::Realm => "realm",
            Kind::User => "user",
            Kind::Profile => "profile",
            Kind::GatewayHost => "gateway host",
            Kind::License => "license",
            Kind::SharedStorage => "shared storage",
            Kind::HostNetwork => "host network",
            Kind::HostIscsi => "host iscsi",
            Kind::ExternalGuest => "external guest",
        };
        f.write_str(name)
    }
}

/// Desired state of one resource, tagged by kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesiredSpec {
    Host(HostSpec),
    StoragePool(StoragePoolSpec),
    Disk(DiskSpec),
    GuestPool(GuestPoolSpec),
    VirtualMachine(VirtualMachineSpec),
    Template(TemplateSpec),
    Realm(RealmSpec),
    User(UserSpec),
    Profile(ProfileSpec),
    GatewayHost(GatewayHostSpec),
    License(LicenseSpec),
    SharedStorage(SharedStorageSpec),
    HostNetwork(HostNetworkSpec),
    HostIscsi(HostIscsiSpec),
    ExternalGuest(ExternalGuestSpec),
}

impl DesiredSpec {
    pub fn kind(&self) -> Kind {
        match self {
            DesiredSpec::Host(_) => Kind::Host,
            DesiredSpec::StoragePool(_) => Kind::StoragePool,
            DesiredSpec::Disk(_) => Kind::Disk,
            DesiredSpec::GuestPool(_) => Kind::GuestPool,
            DesiredSpec::VirtualMachine(_) => Kind::VirtualMachine,
            DesiredSpec::Template(_) => Kind::Template,
            DesiredSpec::Realm(_) => Kind::Realm,
            DesiredSpec::User(_) => Kind::User,
            DesiredSpec::Profile(_) => Kind::Profile,
            DesiredSpec::GatewayHost(_) => Kind::GatewayHost,
            DesiredSpec::License(_) => Kind::License,
            DesiredSpec::SharedStorage(_) => Kind::SharedStorage,
            DesiredSpec::HostNetwork(_) => Kind::HostNetwork,
            DesiredSpec::HostIscsi(_) => Kind::HostIscsi,
            DesiredSpec::ExternalGuest(_) => Kind::ExternalGuest,
        }
    }
}

/// A credential carried in a spec; never printed
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Whether two string lists hold the same members, ignoring order
pub(crate) fn same_members(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b: Vec<&str> = b.iter().map(String::as_str).collect();
    a.sort_unstable();
    a.dedup();
    b.sort_unstable();
    b.dedup();
    a == b
}
