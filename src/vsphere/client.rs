//! HTTP implementation of [`VsphereApi`].
//!
//! Inventory, property reads and tasks use the VI/JSON API under
//! `/sdk/vim25/<release>`; tagging uses the Automation API under `/api`.
//! Both sessions are established at connect time and re-established once
//! when the server answers 401.

use super::{
    Category, CloneSpec, InventoryItem, MoRef, NicBacking, PowerState, Tag, TaskInfo, TaskState,
    VirtualDevice, VirtualMachineInfo, VsphereApi,
};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

const SESSION_HEADER: &str = "vmware-api-session-id";

/// Connection settings for vCenter
#[derive(Debug, Clone)]
pub struct VsphereConfig {
    /// vCenter URL or host name
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// VI/JSON release path segment, e.g. `8.0.2.0`
    pub api_release: String,
}

#[derive(Debug, Default)]
struct Sessions {
    vim: String,
    rest: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceContent {
    root_folder: MoRef,
    search_index: MoRef,
    session_manager: MoRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    annotation: String,
    #[serde(default)]
    template: bool,
    #[serde(default)]
    create_date: Option<DateTime<Utc>>,
    #[serde(default)]
    hardware: VmHardware,
}

#[derive(Debug, Default, Deserialize)]
struct VmHardware {
    #[serde(default)]
    device: Vec<VirtualDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmRuntime {
    #[serde(default)]
    power_state: PowerState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortgroupConfig {
    key: String,
    distributed_virtual_switch: MoRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpaqueNetworkSummary {
    opaque_network_id: String,
    opaque_network_type: String,
}

#[derive(Debug, Deserialize)]
struct TaskInfoWire {
    state: TaskState,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AttachedObject {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Authenticated vCenter client shared by every component
pub struct VsphereClient {
    http: reqwest::Client,
    base: Url,
    config: VsphereConfig,
    content: ServiceContent,
    sessions: RwLock<Sessions>,
}

fn moref_json(reference: &MoRef) -> Value {
    json!({
        "_typeName": "ManagedObjectReference",
        "type": reference.kind,
        "value": reference.value,
    })
}

fn object_id_json(reference: &MoRef) -> Value {
    json!({"object_id": {"id": reference.value, "type": reference.kind}})
}

fn clone_spec_json(spec: &CloneSpec) -> Value {
    let device_change: Vec<Value> = spec
        .config
        .device_change
        .iter()
        .map(|change| {
            json!({
                "_typeName": "VirtualDeviceConfigSpec",
                "operation": change.operation.to_string(),
                "device": change.device.0,
            })
        })
        .collect();
    let extra_config: Vec<Value> = spec
        .config
        .extra_config
        .iter()
        .map(|entry| {
            json!({
                "_typeName": "OptionValue",
                "key": entry.key,
                "value": {"_typeName": "string", "_value": entry.value},
            })
        })
        .collect();
    json!({
        "_typeName": "VirtualMachineCloneSpec",
        "location": {
            "_typeName": "VirtualMachineRelocateSpec",
            "pool": moref_json(&spec.location.pool),
            "datastore": moref_json(&spec.location.datastore),
        },
        "template": false,
        "powerOn": spec.power_on,
        "config": {
            "_typeName": "VirtualMachineConfigSpec",
            "name": spec.config.name,
            "annotation": spec.config.annotation,
            "numCPUs": spec.config.num_cpus,
            "memoryMB": spec.config.memory_mb,
            "guestId": spec.config.guest_id,
            "deviceChange": device_change,
            "extraConfig": extra_config,
        },
    })
}

/// Accepts `host`, `https://host` or `https://host/sdk`
fn base_url(endpoint: &str) -> Result<Url> {
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| OperatorError::Configuration(format!("invalid vSphere endpoint {:?}: {}", endpoint, e)))?;
    url.set_path("");
    url.set_query(None);
    // credentials belong in the dedicated options
    let _ = url.set_username("");
    let _ = url.set_password(None);
    Ok(url)
}

fn fault_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("localizedMessage")
                .or_else(|| v.pointer("/messages/0/default_message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| v.get("_typeName").and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

impl VsphereClient {
    /// Connects and logs in to both APIs
    pub async fn connect(config: VsphereConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        let base = base_url(&config.endpoint)?;

        let content_url = base.join(&format!(
            "sdk/vim25/{}/ServiceInstance/ServiceInstance/content",
            config.api_release
        ))
        .map_err(|e| OperatorError::Configuration(e.to_string()))?;
        let response = http.get(content_url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorError::Platform(format!(
                "reading service content failed ({}): {}",
                status,
                fault_message(&body)
            )));
        }
        let content: ServiceContent = response.json().await?;

        let client = Self {
            http,
            base,
            config,
            content,
            sessions: RwLock::new(Sessions::default()),
        };
        client.login().await?;
        info!(endpoint = %client.base, "Connected to vCenter");
        Ok(client)
    }

    async fn login(&self) -> Result<()> {
        let vim = self.login_vim().await?;
        let rest = self.login_rest().await?;
        let mut sessions = self.sessions.write().await;
        sessions.vim = vim;
        sessions.rest = rest;
        Ok(())
    }

    async fn login_vim(&self) -> Result<String> {
        let url = self.vim_url(&format!(
            "SessionManager/{}/Login",
            self.content.session_manager.value
        ))?;
        let response = self
            .http
            .post(url)
            .json(&json!({"userName": self.config.username, "password": self.config.password}))
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorError::Platform(format!("VI/JSON login failed: {}", fault_message(&body))));
        }
        response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| OperatorError::Platform("VI/JSON login returned no session".to_string()))
    }

    async fn login_rest(&self) -> Result<String> {
        let url = self
            .base
            .join("api/session")
            .map_err(|e| OperatorError::Configuration(e.to_string()))?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorError::Platform(format!("REST login failed: {}", fault_message(&body))));
        }
        Ok(response.json::<String>().await?)
    }

    fn vim_url(&self, path: &str) -> Result<Url> {
        self.base
            .join(&format!("sdk/vim25/{}/{}", self.config.api_release, path))
            .map_err(|e| OperatorError::Configuration(e.to_string()))
    }

    fn rest_url(&self, path: &str) -> Result<Url> {
        self.base
            .join(&format!("api/{}", path))
            .map_err(|e| OperatorError::Configuration(e.to_string()))
    }

    async fn send(&self, method: Method, url: Url, body: Option<&Value>, vim: bool) -> Result<Value> {
        for attempt in 0..2 {
            let session = {
                let sessions = self.sessions.read().await;
                if vim {
                    sessions.vim.clone()
                } else {
                    sessions.rest.clone()
                }
            };
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header(SESSION_HEADER, session);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!(url = %url, "Session expired, logging in again");
                self.login().await?;
                continue;
            }
            let text = response.text().await?;
            if !status.is_success() {
                return Err(OperatorError::Platform(format!(
                    "{} {} failed ({}): {}",
                    method,
                    url.path(),
                    status,
                    fault_message(&text)
                )));
            }
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }
        Err(OperatorError::Platform(format!("{} {}: unauthorized", method, url.path())))
    }

    async fn get_property(&self, reference: &MoRef, property: &str) -> Result<Value> {
        let url = self.vim_url(&format!("{}/{}/{}", reference.kind, reference.value, property))?;
        self.send(Method::GET, url, None, true).await
    }

    async fn invoke(&self, reference: &MoRef, method: &str, body: Value) -> Result<Value> {
        let url = self.vim_url(&format!("{}/{}/{}", reference.kind, reference.value, method))?;
        self.send(Method::POST, url, Some(&body), true).await
    }

    async fn rest(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self.rest_url(path)?;
        self.send(method, url, body.as_ref(), false).await
    }

    async fn children_of(&self, folder: &MoRef) -> Result<Vec<MoRef>> {
        let children = self.get_property(folder, "childEntity").await?;
        if children.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(children)?)
    }

    async fn item(&self, reference: MoRef) -> Result<InventoryItem> {
        let name = self.object_name(&reference).await?;
        Ok(InventoryItem { reference, name })
    }
}

#[async_trait]
impl VsphereApi for VsphereClient {
    async fn datacenters(&self) -> Result<Vec<InventoryItem>> {
        let mut out = Vec::new();
        let mut folders = vec![self.content.root_folder.clone()];
        while let Some(folder) = folders.pop() {
            for child in self.children_of(&folder).await? {
                match child.kind.as_str() {
                    "Datacenter" => out.push(self.item(child).await?),
                    "Folder" => folders.push(child),
                    _ => {}
                }
            }
        }
        Ok(out)
    }

    async fn find_by_inventory_path(&self, path: &str) -> Result<Option<MoRef>> {
        let found = self
            .invoke(
                &self.content.search_index,
                "FindByInventoryPath",
                json!({"inventoryPath": path}),
            )
            .await?;
        if found.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(found)?))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<InventoryItem>> {
        let folder = self
            .find_by_inventory_path(path)
            .await?
            .ok_or_else(|| OperatorError::Platform(format!("folder {} not found", path)))?;
        if folder.kind != "Folder" {
            return Err(OperatorError::Platform(format!("{} is a {}, not a folder", path, folder.kind)));
        }
        let mut out = Vec::new();
        for child in self.children_of(&folder).await? {
            out.push(self.item(child).await?);
        }
        Ok(out)
    }

    async fn find_vm_by_uuid(&self, datacenter: &MoRef, uuid: &str) -> Result<Option<MoRef>> {
        let found = self
            .invoke(
                &self.content.search_index,
                "FindByUuid",
                json!({
                    "datacenter": moref_json(datacenter),
                    "uuid": uuid,
                    "vmSearch": true,
                    "instanceUuid": false,
                }),
            )
            .await?;
        if found.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(found)?))
    }

    async fn virtual_machine(&self, vm: &MoRef) -> Result<VirtualMachineInfo> {
        let config: VmConfig = serde_json::from_value(self.get_property(vm, "config").await?)?;
        let runtime: VmRuntime = serde_json::from_value(self.get_property(vm, "runtime").await?)?;
        Ok(VirtualMachineInfo {
            name: config.name,
            uuid: config.uuid,
            annotation: config.annotation,
            template: config.template,
            create_date: config.create_date,
            power_state: runtime.power_state,
            devices: config.hardware.device,
        })
    }

    async fn object_name(&self, reference: &MoRef) -> Result<String> {
        let name = self.get_property(reference, "name").await?;
        name.as_str()
            .map(str::to_string)
            .ok_or_else(|| OperatorError::Platform(format!("{} has no name", reference)))
    }

    async fn network_backing(&self, network: &MoRef) -> Result<NicBacking> {
        match network.kind.as_str() {
            "DistributedVirtualPortgroup" => {
                let config: PortgroupConfig =
                    serde_json::from_value(self.get_property(network, "config").await?)?;
                let uuid = self
                    .get_property(&config.distributed_virtual_switch, "uuid")
                    .await?;
                Ok(NicBacking::DistributedPortgroup {
                    switch_uuid: uuid.as_str().unwrap_or_default().to_string(),
                    portgroup_key: config.key,
                })
            }
            "OpaqueNetwork" => {
                let summary: OpaqueNetworkSummary =
                    serde_json::from_value(self.get_property(network, "summary").await?)?;
                Ok(NicBacking::Opaque {
                    network_id: summary.opaque_network_id,
                    network_type: summary.opaque_network_type,
                })
            }
            _ => Ok(NicBacking::Network {
                device_name: self.object_name(network).await?,
                network: network.clone(),
            }),
        }
    }

    async fn clone_vm(
        &self,
        template: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<MoRef> {
        let task = self
            .invoke(
                template,
                "CloneVM_Task",
                json!({"folder": moref_json(folder), "name": name, "spec": clone_spec_json(spec)}),
            )
            .await?;
        Ok(serde_json::from_value(task)?)
    }

    async fn power_off_vm(&self, vm: &MoRef) -> Result<MoRef> {
        Ok(serde_json::from_value(self.invoke(vm, "PowerOffVM_Task", json!({})).await?)?)
    }

    async fn destroy(&self, vm: &MoRef) -> Result<MoRef> {
        Ok(serde_json::from_value(self.invoke(vm, "Destroy_Task", json!({})).await?)?)
    }

    async fn task_info(&self, task: &MoRef) -> Result<TaskInfo> {
        let info: TaskInfoWire = serde_json::from_value(self.get_property(task, "info").await?)?;
        Ok(TaskInfo {
            state: info.state,
            error: info.error.map(|e| {
                e.get("localizedMessage")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            }),
        })
    }

    async fn list_categories(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_value(
            self.rest(Method::GET, "cis/tagging/category", None).await?,
        )?)
    }

    async fn category(&self, id: &str) -> Result<Category> {
        Ok(serde_json::from_value(
            self.rest(Method::GET, &format!("cis/tagging/category/{}", id), None)
                .await?,
        )?)
    }

    async fn create_category(&self, category: &Category) -> Result<String> {
        let body = json!({
            "name": category.name,
            "description": category.description,
            "cardinality": category.cardinality,
            "associable_types": category.associable_types,
        });
        Ok(serde_json::from_value(
            self.rest(Method::POST, "cis/tagging/category", Some(body)).await?,
        )?)
    }

    async fn list_tags_for_category(&self, category_id: &str) -> Result<Vec<String>> {
        Ok(serde_json::from_value(
            self.rest(
                Method::POST,
                "cis/tagging/tag?action=list-tags-for-category",
                Some(json!({"category_id": category_id})),
            )
            .await?,
        )?)
    }

    async fn tag(&self, id: &str) -> Result<Tag> {
        Ok(serde_json::from_value(
            self.rest(Method::GET, &format!("cis/tagging/tag/{}", id), None)
                .await?,
        )?)
    }

    async fn create_tag(&self, tag: &Tag) -> Result<String> {
        let body = json!({
            "name": tag.name,
            "description": tag.description,
            "category_id": tag.category_id,
        });
        Ok(serde_json::from_value(
            self.rest(Method::POST, "cis/tagging/tag", Some(body)).await?,
        )?)
    }

    async fn attach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()> {
        self.rest(
            Method::POST,
            &format!("cis/tagging/tag-association/{}?action=attach", tag_id),
            Some(object_id_json(object)),
        )
        .await?;
        Ok(())
    }

    async fn attached_tags(&self, object: &MoRef) -> Result<Vec<String>> {
        Ok(serde_json::from_value(
            self.rest(
                Method::POST,
                "cis/tagging/tag-association?action=list-attached-tags",
                Some(object_id_json(object)),
            )
            .await?,
        )?)
    }

    async fn attached_objects(&self, tag_id: &str) -> Result<Vec<MoRef>> {
        let objects: Vec<AttachedObject> = serde_json::from_value(
            self.rest(
                Method::POST,
                &format!("cis/tagging/tag-association/{}?action=list-attached-objects", tag_id),
                None,
            )
            .await?,
        )?;
        Ok(objects
            .into_iter()
            .map(|o| MoRef {
                kind: o.kind,
                value: o.id,
            })
            .collect())
    }
}
