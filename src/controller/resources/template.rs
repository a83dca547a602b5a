//! Guest templates
//!
//! Templates are keyed by name. The control plane analyses a new template in
//! the background; once the create settle has passed it must report
//! `available`, anything else means the template is unusable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::guest_pool::project_broker;
use super::virtual_machine::InterfaceSpec;
use super::Kind;
use crate::client::types::{BrokerOptions, NetworkInterface, Template, TemplateDisk};
use crate::controller::classify::NotFoundExt;
use crate::controller::context::ReconcileContext;
use crate::controller::engine::ResourceKind;
use crate::controller::projector::{CallerState, Projection};
use crate::controller::retry::with_retry;
use crate::error::{Error, Result, StepContext};

pub const STATE_AVAILABLE: &str = "available";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateDiskSpec {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub storage_id: String,
    pub filename: String,
    pub disk_driver: String,
    pub format: String,
}

impl Default for TemplateDiskSpec {
    fn default() -> Self {
        Self {
            disk_type: "Disk".to_string(),
            storage_id: String::new(),
            filename: String::new(),
            disk_driver: "virtio".to_string(),
            format: "qcow2".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSpec {
    pub name: String,
    pub cpu: u32,
    /// Memory in MB
    pub memory: u32,
    pub firmware: String,
    pub display_driver: String,
    pub os: String,
    pub manual_agent_install: bool,
    pub disks: Vec<TemplateDiskSpec>,
    pub interfaces: Vec<InterfaceSpec>,
    pub broker: Option<BrokerOptions>,
}

impl Default for TemplateSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            cpu: 2,
            memory: 4096,
            firmware: "uefi".to_string(),
            display_driver: "cirrus".to_string(),
            os: String::new(),
            manual_agent_install: false,
            disks: Vec::new(),
            interfaces: Vec::new(),
            broker: None,
        }
    }
}

impl TemplateSpec {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("template name must be set"));
        }
        if self.cpu == 0 || self.memory == 0 {
            return Err(Error::validation(format!(
                "template {} needs cpu and memory",
                self.name
            )));
        }
        Ok(())
    }

    fn to_remote(&self) -> Template {
        Template {
            name: self.name.clone(),
            vcpu: self.cpu,
            mem: self.memory,
            firmware: self.firmware.clone(),
            display_driver: self.display_driver.clone(),
            os: self.os.clone(),
            manual_agent_install: self.manual_agent_install,
            disks: self
                .disks
                .iter()
                .map(|d| TemplateDisk {
                    disk_type: d.disk_type.clone(),
                    storage_id: d.storage_id.clone(),
                    filename: d.filename.clone(),
                    disk_driver: d.disk_driver.clone(),
                    format: d.format.clone(),
                })
                .collect(),
            interfaces: self.interfaces.iter().map(NetworkInterface::from).collect(),
            broker_options: self.broker.clone(),
            ..Default::default()
        }
    }

    /// Whether the remote template differs in any field this spec controls
    fn differs(&self, current: &Template) -> bool {
        let mut want = self.to_remote();
        want.state = current.state.clone();
        want.state_message = current.state_message.clone();
        if want.broker_options.is_none() {
            want.broker_options = current.broker_options.clone();
        }
        want != *current
    }
}

pub struct TemplateResource;

#[async_trait]
impl ResourceKind for TemplateResource {
    type Spec = TemplateSpec;
    type Object = Template;

    const KIND: Kind = Kind::Template;

    async fn lookup_existing(
        &self,
        ctx: &ReconcileContext,
        spec: &TemplateSpec,
    ) -> Result<Option<Template>> {
        spec.validate()?;
        ctx.gateway().get_template(&spec.name).await.or_absent()
    }

    async fn create(&self, ctx: &ReconcileContext, spec: &TemplateSpec) -> Result<String> {
        info!(template = %spec.name, "Creating template");
        ctx.gateway()
            .create_template(&spec.to_remote())
            .await
            .step("post template")?;
        Ok(spec.name.clone())
    }

    fn verify_created(&self, template: &Template) -> Result<()> {
        if template.state == STATE_AVAILABLE {
            return Ok(());
        }
        let detail = if template.state_message.is_empty() {
            String::new()
        } else {
            format!(": {}", template.state_message)
        };
        Err(Error::unexpected(format!(
            "template {} is in state '{}' after create{detail}",
            template.name, template.state
        )))
    }

    async fn apply_delta(
        &self,
        ctx: &ReconcileContext,
        spec: &TemplateSpec,
        current: Template,
    ) -> Result<()> {
        if !spec.differs(&current) {
            return Ok(());
        }
        info!(template = %spec.name, "Updating template");
        let mut updated = spec.to_remote();
        if updated.broker_options.is_none() {
            updated.broker_options = current.broker_options;
        }
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("update template {}", spec.name), 0, || {
            gateway.update_template(&updated)
        })
        .await
        .step("put template")
    }

    async fn fetch(&self, ctx: &ReconcileContext, id: &str) -> Result<Template> {
        ctx.gateway().get_template(id).await
    }

    async fn delete(&self, ctx: &ReconcileContext, id: &str, _current: Template) -> Result<()> {
        let gateway = ctx.gateway();
        with_retry(ctx, &format!("delete template {id}"), 0, || gateway.delete_template(id)).await
    }

    fn object_id(&self, template: &Template) -> String {
        template.name.clone()
    }

    fn project(&self, template: &Template) -> CallerState {
        Projection::new()
            .set("name", template.name.as_str())
            .set("cpu", template.vcpu)
            .set("memory", template.mem)
            .set_non_empty("firmware", &template.firmware)
            .set_non_empty("display_driver", &template.display_driver)
            .set_non_empty("os", &template.os)
            .set("manual_agent_install", template.manual_agent_install)
            .set_non_empty("state", &template.state)
            .set_non_empty("state_message", &template.state_message)
            .nest_list(
                "disks",
                template.disks.iter().map(|d| {
                    Projection::new()
                        .set("type", d.disk_type.as_str())
                        .set("storage_id", d.storage_id.as_str())
                        .set("filename", d.filename.as_str())
                        .set("disk_driver", d.disk_driver.as_str())
                        .set_non_empty("format", &d.format)
                }),
            )
            .nest_list(
                "interfaces",
                template.interfaces.iter().map(|i| {
                    Projection::new()
                        .set("network", i.network.as_str())
                        .set("vlan", i.vlan)
                        .set("emulation", i.emulation.as_str())
                }),
            )
            .nest("broker", project_broker(template.broker_options.as_ref()))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> TemplateSpec {
        TemplateSpec {
            name: "win10".to_string(),
            os: "win10".to_string(),
            disks: vec![TemplateDiskSpec {
                storage_id: "sp-1".to_string(),
                filename: "win10.qcow2".to_string(),
                ..Default::default()
            }],
            interfaces: vec![InterfaceSpec {
                network: "prod".to_string(),
                vlan: 0,
                emulation: "virtio".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_differs_ignores_remote_state() {
        let mut remote = spec().to_remote();
        remote.state = "available".to_string();
        remote.state_message = "analysed".to_string();
        assert!(!spec().differs(&remote));

        remote.mem = 8192;
        assert!(spec().differs(&remote));
    }

    #[test]
    fn test_unavailable_template_fails_create_check() {
        let mut remote = spec().to_remote();
        remote.state = "failed".to_string();
        remote.state_message = "no bootable disk".to_string();

        let err = TemplateResource.verify_created(&remote).unwrap_err();
        assert!(err.to_string().contains("state 'failed'"));
        assert!(err.to_string().contains("no bootable disk"));

        remote.state = STATE_AVAILABLE.to_string();
        assert!(TemplateResource.verify_created(&remote).is_ok());
    }

    #[test]
    fn test_projection() {
        let mut remote = spec().to_remote();
        remote.state = "available".to_string();
        let state = TemplateResource.project(&remote);
        assert_eq!(state["name"], json!("win10"));
        assert_eq!(state["cpu"], json!(2));
        assert_eq!(state["disks"][0]["type"], json!("Disk"));
        assert_eq!(state["interfaces"][0]["network"], json!("prod"));
        assert!(!state.contains_key("broker"));
    }
}
