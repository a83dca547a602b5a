//! Typed operation set against the control plane, one group per resource kind
//!
//! Implementations issue exactly one request per call and never retry;
//! retry policy belongs to the engine, which consults the error classifier.

use async_trait::async_trait;

use super::types::{
    Cluster, ClusterGateway, ConvertDisk, ExternalGuest, Guest, Host, HostNetwork,
    IscsiLogin, IscsiSession, IscsiTarget, NewDisk, Pool, Profile, Realm, StorageDisk,
    StoragePool, Task, Template, User,
};
use crate::error::Result;

#[async_trait]
pub trait ObjectGateway: Send + Sync {
    // tasks
    async fn get_task(&self, id: &str) -> Result<Task>;

    // hosts
    async fn list_hosts(&self) -> Result<Vec<Host>>;
    async fn get_host(&self, id: &str) -> Result<Host>;
    async fn join_host(&self, username: &str, password: &str, address: &str) -> Result<Task>;
    async fn set_host_state(&self, id: &str, state: &str) -> Result<Task>;
    async fn set_gateway_mode(&self, id: &str, enabled: bool) -> Result<()>;
    async fn update_appliance(&self, id: &str, host: &Host) -> Result<()>;
    async fn unjoin_host(&self, id: &str) -> Result<Task>;
    async fn delete_host(&self, id: &str) -> Result<()>;

    // host networks and iSCSI
    async fn get_host_network(&self, host_id: &str, name: &str) -> Result<HostNetwork>;
    async fn set_host_network(&self, host_id: &str, network: &HostNetwork) -> Result<()>;
    async fn delete_host_network(&self, host_id: &str, name: &str) -> Result<()>;
    async fn iscsi_discover(&self, host_id: &str, portal: &str) -> Result<Vec<IscsiTarget>>;
    async fn iscsi_sessions(
        &self,
        host_id: &str,
        portal: &str,
        target: &str,
    ) -> Result<Vec<IscsiSession>>;
    async fn iscsi_login(&self, host_id: &str, login: &IscsiLogin) -> Result<Vec<IscsiSession>>;
    async fn iscsi_logout(&self, host_id: &str, portal: &str, target: &str) -> Result<()>;

    // storage pools
    async fn list_storage_pools(&self) -> Result<Vec<StoragePool>>;
    async fn get_storage_pool(&self, id: &str) -> Result<StoragePool>;
    async fn create_storage_pool(&self, pool: &StoragePool) -> Result<()>;
    async fn update_storage_pool(&self, pool: &StoragePool) -> Result<()>;
    async fn delete_storage_pool(&self, id: &str) -> Result<()>;

    // disks
    async fn disk_info(&self, storage_id: &str, filename: &str) -> Result<StorageDisk>;
    async fn create_disk(&self, storage_id: &str, disk: &NewDisk) -> Result<Task>;
    async fn copy_url(&self, storage_id: &str, url: &str, filename: &str) -> Result<Task>;
    async fn convert_disk(&self, src_storage_id: &str, request: &ConvertDisk) -> Result<Task>;
    async fn grow_disk(&self, storage_id: &str, filename: &str, gigabytes: u64) -> Result<Task>;
    async fn delete_file(&self, storage_id: &str, filename: &str) -> Result<()>;

    // pools and guests
    async fn list_pools(&self) -> Result<Vec<Pool>>;
    async fn get_pool(&self, id: &str) -> Result<Pool>;
    async fn create_pool(&self, pool: &Pool) -> Result<()>;
    async fn update_pool(&self, pool: &Pool) -> Result<()>;
    async fn delete_pool(&self, id: &str) -> Result<()>;
    async fn get_guest(&self, name: &str) -> Result<Guest>;
    async fn create_external_guest(&self, guest: &ExternalGuest) -> Result<()>;
    async fn delete_guest(&self, name: &str) -> Result<()>;

    // templates
    async fn get_template(&self, name: &str) -> Result<Template>;
    async fn create_template(&self, template: &Template) -> Result<()>;
    async fn update_template(&self, template: &Template) -> Result<()>;
    async fn delete_template(&self, name: &str) -> Result<()>;

    // realms
    async fn get_realm(&self, name: &str) -> Result<Realm>;
    async fn create_realm(&self, realm: &Realm) -> Result<()>;
    async fn update_realm(&self, realm: &Realm) -> Result<()>;
    async fn delete_realm(&self, name: &str) -> Result<()>;

    // users
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn get_user(&self, id: &str) -> Result<User>;
    async fn create_user(&self, user: &User) -> Result<()>;
    async fn update_user(&self, user: &User) -> Result<()>;
    async fn delete_user(&self, id: &str) -> Result<()>;

    // profiles
    async fn list_profiles(&self) -> Result<Vec<Profile>>;
    async fn get_profile(&self, id: &str) -> Result<Profile>;
    async fn create_profile(&self, profile: &Profile) -> Result<()>;
    async fn update_profile(&self, profile: &Profile) -> Result<()>;
    async fn delete_profile(&self, id: &str) -> Result<()>;

    // cluster
    async fn cluster_id(&self) -> Result<String>;
    async fn get_cluster(&self, id: &str) -> Result<Cluster>;
    async fn set_license(&self, cluster_id: &str, license: &str) -> Result<()>;
    async fn get_gateway(&self, cluster_id: &str) -> Result<ClusterGateway>;
    async fn set_gateway(&self, cluster_id: &str, gateway: &ClusterGateway) -> Result<()>;
    async fn enable_shared_storage(
        &self,
        cluster_id: &str,
        utilization: u32,
        set_size: u32,
    ) -> Result<Task>;
    async fn disable_shared_storage(&self, cluster_id: &str) -> Result<Task>;

    // natural-key lookups built on the list calls

    async fn find_host(&self, address: &str) -> Result<Option<Host>> {
        Ok(self
            .list_hosts()
            .await?
            .into_iter()
            .find(|h| h.matches_address(address)))
    }

    async fn find_storage_pool(&self, name: &str) -> Result<Option<StoragePool>> {
        Ok(self
            .list_storage_pools()
            .await?
            .into_iter()
            .find(|p| p.name == name))
    }

    async fn find_pool(&self, name: &str) -> Result<Option<Pool>> {
        Ok(self.list_pools().await?.into_iter().find(|p| p.name == name))
    }

    async fn find_profile(&self, name: &str) -> Result<Option<Profile>> {
        Ok(self
            .list_profiles()
            .await?
            .into_iter()
            .find(|p| p.name == name))
    }
}
