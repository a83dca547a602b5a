//! Disk files inside a storage pool
//!
//! A disk is identified as `{storage_id}/{filename}`. It is created blank
//! (optionally on a backing file), converted from a file in another pool, or
//! copied from a URL; each of these is a task. A requested size larger than
//! the file's virtual size grows the disk by the difference.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Kind;
use crate::client::types::{ConvertDisk, NewDisk, StorageDisk};
use crate::controller::classify::NotFoundExt;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::controller::task::await_task;
use crate::error::{Error, Result, StepContext};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum DiskSource {
    #[default]
    Blank,
    /// Blank disk layered on an existing file
    Backing {
        storage_id: String,
        filename: String,
        #[serde(default)]
        format: String,
    },
    /// Convert a file from another pool
    Pool { storage_id: String, filename: String },
    Url { url: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    pub storage_id: String,
    pub filename: String,
    pub format: String,
    /// Size in GiB
    pub size: u64,
    pub source: DiskSource,
}

impl Default for DiskSpec {
    fn default() -> Self {
        Self {
            storage_id: String::new(),
            filename: String::new(),
            format: "qcow2".to_string(),
            size: 0,
            source: DiskSource::Blank,
        }
    }
}

impl DiskSpec {
    pub fn id(&self) -> String {
        disk_id(&self.storage_id, &self.filename)
    }

    fn validate(&self) -> Result<()> {
        if self.storage_id.is_empty() || self.filename.is_empty() {
            return Err(Error::validation("disk needs storage_id and filename"));
        }
        if self.filename.contains('/') {
            return Err(Error::validation(format!(
                "disk filename '{}' must not contain '/'",
                self.filename
            )));
        }
        Ok(())
    }
}

pub fn disk_id(storage_id: &str, filename: &str) -> String {
    format!("{storage_id}/{filename}")
}

/// Split a disk id into storage pool id and filename
pub fn parse_disk_id(id: &str) -> Result<(&str, &str)> {
    match id.split_once('/') {
        Some((storage, file)) if !storage.is_empty() && !file.is_empty() => Ok((storage, file)),
        _ => Err(Error::validation(format!(
            "disk id '{id}' is not of the form <storage_id>/<filename>"
        ))),
    }
}

pub struct DiskResource;

#[async_trait]
impl ResourceKind for DiskResource {
    type Spec = DiskSpec;
    type Object = StorageDisk;

    const KIND: Kind = Kind::Disk;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &DiskSpec,
    ) -> Result<Option<StorageDisk>> {
        spec.validate()?;
        ctx.gateway()
            .disk_info(&spec.storage_id, &spec.filename)
            .await
            .or_absent()
            .map(|found| found.map(|disk| with_storage(disk, &spec.storage_id)))
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &DiskSpec) -> Result<String> {
        let gateway = ctx.gateway();
        let storage = spec.storage_id.as_str();
        let file = spec.filename.as_str();

        let task = match &spec.source {
            DiskSource::Blank => {
                info!(storage = %storage, file = %file, "Creating blank disk");
                gateway
                    .create_disk(
                        storage,
                        &NewDisk {
                            filename: file.to_string(),
                            format: spec.format.clone(),
                            size: spec.size,
                            backing_file: None,
                        },
                    )
                    .await
            }
            DiskSource::Backing {
                storage_id,
                filename,
                format,
            } => {
                info!(storage = %storage, file = %file, backing = %filename, "Creating disk on backing file");
                gateway
                    .create_disk(
                        storage,
                        &NewDisk {
                            filename: file.to_string(),
                            format: spec.format.clone(),
                            size: spec.size,
                            backing_file: Some(StorageDisk {
                                storage_id: storage_id.clone(),
                                filename: filename.clone(),
                                format: format.clone(),
                                ..Default::default()
                            }),
                        },
                    )
                    .await
            }
            DiskSource::Pool {
                storage_id,
                filename,
            } => {
                info!(storage = %storage, file = %file, from = %filename, "Converting disk");
                gateway
                    .convert_disk(
                        storage_id,
                        &ConvertDisk {
                            src_filename: filename.clone(),
                            dest_storage_id: storage.to_string(),
                            dest_filename: file.to_string(),
                            format: spec.format.clone(),
                        },
                    )
                    .await
            }
            DiskSource::Url { url } => {
                info!(storage = %storage, file = %file, url = %url, "Copying disk from url");
                gateway.copy_url(storage, url, file).await
            }
        }
        .step("submit disk create")?;

        await_task(ctx, task).await.step("disk create")?;
        Ok(spec.id())
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &DiskSpec,
        current: StorageDisk,
    ) -> Result<()> {
        let current_gib = current.virtual_size / GIB;
        if spec.size <= current_gib {
            return Ok(());
        }

        let grow_by = spec.size - current_gib;
        info!(disk = %spec.id(), from_gib = current_gib, to_gib = spec.size, "Growing disk");
        let gateway = ctx.gateway();
        let task = with_retry(ctx, &format!("grow disk {}", spec.id()), 0, || {
            gateway.grow_disk(&spec.storage_id, &spec.filename, grow_by)
        })
        .await
        .step("submit grow")?;
        await_task(ctx, task).await.step("grow")?;
        Ok(())
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<StorageDisk> {
        let (storage, file) = parse_disk_id(id)?;
        let disk = ctx.gateway().disk_info(storage, file).await?;
        Ok(with_storage(disk, storage))
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: StorageDisk) -> Result<()> {
        let (storage, file) = parse_disk_id(id)?;
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete disk {id}"), 0, || gateway.delete_file(storage, file))
            .await
            .or_absent()
            .map(|_| ())
    }

    fn object_id(&self, disk: &StorageDisk) -> String {
        disk_id(&disk.storage_id, &disk.filename)
    }

    fn project(&self, disk: &StorageDisk) -> CallerState {
        Projection::new()
            .set("id", self.object_id(disk))
            .set("storage_id", disk.storage_id.as_str())
            .set("filename", disk.filename.as_str())
            .set_non_empty("format", &disk.format)
            .set("size", disk.virtual_size / GIB)
            .set("virtual_size", disk.virtual_size)
            .set("actual_size", disk.actual_size)
            .build()
    }
}

/// Disk info responses do not always echo the pool id
fn with_storage(mut disk: StorageDisk, storage_id: &str) -> StorageDisk {
    if disk.storage_id.is_empty() {
        disk.storage_id = storage_id.to_string();
    }
    disk
}
