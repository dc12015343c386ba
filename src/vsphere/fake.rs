//! In-memory [`VsphereApi`] used by unit tests.

use super::{
    Category, CloneSpec, InventoryItem, MoRef, NicBacking, PowerState, Tag, TaskInfo, TaskState,
    VirtualDevice, VirtualMachineInfo, VsphereApi,
};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    next_id: u64,
    /// inventory path -> object
    paths: BTreeMap<String, MoRef>,
    names: BTreeMap<MoRef, String>,
    vms: BTreeMap<MoRef, VirtualMachineInfo>,
    categories: BTreeMap<String, Category>,
    tags: BTreeMap<String, Tag>,
    attachments: BTreeSet<(String, MoRef)>,
    tasks: BTreeMap<MoRef, TaskInfo>,
    clones: Vec<(String, CloneSpec)>,
    calls: Vec<String>,
    failing_operations: BTreeSet<String>,
    /// name -> listings left that leave it out
    hidden_categories: BTreeMap<String, usize>,
    hidden_tags: BTreeMap<String, usize>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn insert(&mut self, path: &str, kind: &str) -> MoRef {
        let prefix = kind.to_lowercase();
        let reference = MoRef::new(kind, &self.id(&prefix));
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        self.paths.insert(path.to_string(), reference.clone());
        self.names.insert(reference.clone(), name);
        reference
    }

    fn path_of(&self, reference: &MoRef) -> Option<String> {
        self.paths
            .iter()
            .find(|(_, r)| *r == reference)
            .map(|(p, _)| p.clone())
    }

    fn task(&mut self, operation: &str) -> MoRef {
        let task = MoRef::new("Task", &self.id("task"));
        let info = if self.failing_operations.contains(operation) {
            TaskInfo {
                state: TaskState::Error,
                error: Some(format!("{} failed", operation)),
            }
        } else {
            TaskInfo {
                state: TaskState::Success,
                error: None,
            }
        };
        self.tasks.insert(task.clone(), info);
        task
    }
}

/// Inventory, tagging and tasks held in memory. Tasks complete immediately.
#[derive(Default)]
pub struct FakeVsphere {
    state: Mutex<State>,
}

pub fn template_disk(capacity_kb: i64) -> VirtualDevice {
    VirtualDevice(serde_json::json!({
        "_typeName": "VirtualDisk",
        "key": 2000,
        "capacityInKB": capacity_kb,
    }))
}

pub fn template_nic(key: i64) -> VirtualDevice {
    VirtualDevice(serde_json::json!({"_typeName": "VirtualE1000", "key": key}))
}

impl FakeVsphere {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a datacenter with its standard child folders
    pub fn add_datacenter(&self, name: &str) -> MoRef {
        let mut state = self.state.lock().unwrap();
        let dc = state.insert(&format!("/{}", name), "Datacenter");
        for folder in ["vm", "host", "datastore", "network"] {
            state.insert(&format!("/{}/{}", name, folder), "Folder");
        }
        dc
    }

    pub fn add_object(&self, path: &str, kind: &str) -> MoRef {
        self.state.lock().unwrap().insert(path, kind)
    }

    pub fn add_vm(&self, path: &str, mut info: VirtualMachineInfo) -> MoRef {
        let mut state = self.state.lock().unwrap();
        let vm = state.insert(path, "VirtualMachine");
        info.name = path.rsplit('/').next().unwrap_or_default().to_string();
        if info.uuid.is_empty() {
            info.uuid = format!("uuid-{}", vm.value);
        }
        state.vms.insert(vm.clone(), info);
        vm
    }

    pub fn add_template(&self, path: &str, disk_kb: i64) -> MoRef {
        self.add_vm(
            path,
            VirtualMachineInfo {
                template: true,
                devices: vec![template_disk(disk_kb), template_nic(4000)],
                ..Default::default()
            },
        )
    }

    /// Creates the category and tag when missing and attaches the tag
    pub fn tag_object(&self, category: &str, tag: &str, object: &MoRef) {
        let mut state = self.state.lock().unwrap();
        let category_id = match state.categories.values().find(|c| c.name == category) {
            Some(c) => c.id.clone(),
            None => {
                let id = state.id("category");
                state.categories.insert(
                    id.clone(),
                    Category {
                        id: id.clone(),
                        name: category.to_string(),
                        ..Default::default()
                    },
                );
                id
            }
        };
        let tag_id = match state
            .tags
            .values()
            .find(|t| t.name == tag && t.category_id == category_id)
        {
            Some(t) => t.id.clone(),
            None => {
                let id = state.id("tag");
                state.tags.insert(
                    id.clone(),
                    Tag {
                        id: id.clone(),
                        name: tag.to_string(),
                        description: String::new(),
                        category_id,
                    },
                );
                id
            }
        };
        state.attachments.insert((tag_id, object.clone()));
    }

    /// Category name to tag name for everything attached to `object`
    pub fn tags_of(&self, object: &MoRef) -> BTreeMap<String, String> {
        let state = self.state.lock().unwrap();
        state
            .attachments
            .iter()
            .filter(|(_, o)| o == object)
            .filter_map(|(tag_id, _)| {
                let tag = state.tags.get(tag_id)?;
                let category = state.categories.get(&tag.category_id)?;
                Some((category.name.clone(), tag.name.clone()))
            })
            .collect()
    }

    pub fn category_named(&self, name: &str) -> Option<Category> {
        let state = self.state.lock().unwrap();
        state.categories.values().find(|c| c.name == name).cloned()
    }

    pub fn vm_named(&self, name: &str) -> Option<(MoRef, VirtualMachineInfo)> {
        let state = self.state.lock().unwrap();
        state
            .vms
            .iter()
            .find(|(_, info)| info.name == name)
            .map(|(r, info)| (r.clone(), info.clone()))
    }

    pub fn vm_count(&self) -> usize {
        self.state.lock().unwrap().vms.values().filter(|vm| !vm.template).count()
    }

    pub fn set_power_state(&self, vm: &MoRef, power_state: PowerState) {
        if let Some(info) = self.state.lock().unwrap().vms.get_mut(vm) {
            info.power_state = power_state;
        }
    }

    pub fn set_create_date(&self, vm: &MoRef, create_date: chrono::DateTime<Utc>) {
        if let Some(info) = self.state.lock().unwrap().vms.get_mut(vm) {
            info.create_date = Some(create_date);
        }
    }

    /// Clone specs issued so far, with their target folder path
    pub fn clones(&self) -> Vec<(String, CloneSpec)> {
        self.state.lock().unwrap().clones.clone()
    }

    /// Mutating calls in order, e.g. `power_off vm-3`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Tasks for `operation` (`clone`, `power_off`, `destroy`) end in error
    pub fn fail_operation(&self, operation: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_operations
            .insert(operation.to_string());
    }

    /// The next `listings` category listings leave out the category `name`,
    /// as if another writer created it after the listing was taken
    pub fn hide_category(&self, name: &str, listings: usize) {
        self.state
            .lock()
            .unwrap()
            .hidden_categories
            .insert(name.to_string(), listings);
    }

    /// Same as [`FakeVsphere::hide_category`] for tags named `name`
    pub fn hide_tag(&self, name: &str, listings: usize) {
        self.state
            .lock()
            .unwrap()
            .hidden_tags
            .insert(name.to_string(), listings);
    }

    pub fn category_count(&self) -> usize {
        self.state.lock().unwrap().categories.len()
    }

    pub fn tag_count(&self) -> usize {
        self.state.lock().unwrap().tags.len()
    }

    pub fn tag_named(&self, name: &str) -> Option<Tag> {
        let state = self.state.lock().unwrap();
        state.tags.values().find(|t| t.name == name).cloned()
    }
}

/// Consumes one hidden listing for `name`
fn take_hidden(hidden: &mut BTreeMap<String, usize>, name: &str) -> bool {
    match hidden.get_mut(name) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

fn not_found(what: &str) -> OperatorError {
    OperatorError::Platform(format!("{} not found", what))
}

#[async_trait]
impl VsphereApi for FakeVsphere {
    async fn datacenters(&self) -> Result<Vec<InventoryItem>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .names
            .iter()
            .filter(|(r, _)| r.kind == "Datacenter")
            .map(|(r, name)| InventoryItem {
                reference: r.clone(),
                name: name.clone(),
            })
            .collect())
    }

    async fn find_by_inventory_path(&self, path: &str) -> Result<Option<MoRef>> {
        Ok(self.state.lock().unwrap().paths.get(path).cloned())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<InventoryItem>> {
        let state = self.state.lock().unwrap();
        if !state.paths.contains_key(path) {
            return Err(not_found(path));
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(state
            .paths
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
            .map(|(p, r)| InventoryItem {
                reference: r.clone(),
                name: p[prefix.len()..].to_string(),
            })
            .collect())
    }

    async fn find_vm_by_uuid(&self, _datacenter: &MoRef, uuid: &str) -> Result<Option<MoRef>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .vms
            .iter()
            .find(|(_, info)| info.uuid == uuid)
            .map(|(r, _)| r.clone()))
    }

    async fn virtual_machine(&self, vm: &MoRef) -> Result<VirtualMachineInfo> {
        let state = self.state.lock().unwrap();
        state.vms.get(vm).cloned().ok_or_else(|| not_found(&vm.to_string()))
    }

    async fn object_name(&self, reference: &MoRef) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .names
            .get(reference)
            .cloned()
            .ok_or_else(|| not_found(&reference.to_string()))
    }

    async fn network_backing(&self, network: &MoRef) -> Result<NicBacking> {
        Ok(NicBacking::Network {
            device_name: self.object_name(network).await?,
            network: network.clone(),
        })
    }

    async fn clone_vm(
        &self,
        template: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<MoRef> {
        let mut state = self.state.lock().unwrap();
        let source = state
            .vms
            .get(template)
            .cloned()
            .ok_or_else(|| not_found(&template.to_string()))?;
        let folder_path = state
            .path_of(folder)
            .ok_or_else(|| not_found(&folder.to_string()))?;
        state.calls.push(format!("clone {}", name));
        state.clones.push((folder_path.clone(), spec.clone()));

        let task = state.task("clone");
        if state.tasks.get(&task).map(|t| t.state) == Some(TaskState::Error) {
            return Ok(task);
        }
        let vm = state.insert(&format!("{}/{}", folder_path, name), "VirtualMachine");
        let info = VirtualMachineInfo {
            name: name.to_string(),
            uuid: format!("uuid-{}", vm.value),
            annotation: spec.config.annotation.clone(),
            template: false,
            create_date: Some(Utc::now()),
            power_state: if spec.power_on {
                PowerState::PoweredOn
            } else {
                PowerState::PoweredOff
            },
            devices: source.devices,
        };
        state.vms.insert(vm, info);
        Ok(task)
    }

    async fn power_off_vm(&self, vm: &MoRef) -> Result<MoRef> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("power_off {}", vm.value));
        let task = state.task("power_off");
        if state.tasks.get(&task).map(|t| t.state) == Some(TaskState::Success) {
            if let Some(info) = state.vms.get_mut(vm) {
                info.power_state = PowerState::PoweredOff;
            }
        }
        Ok(task)
    }

    async fn destroy(&self, vm: &MoRef) -> Result<MoRef> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("destroy {}", vm.value));
        let task = state.task("destroy");
        if state.tasks.get(&task).map(|t| t.state) == Some(TaskState::Success) {
            state.vms.remove(vm);
            state.paths.retain(|_, r| r != vm);
            state.names.remove(vm);
        }
        Ok(task)
    }

    async fn task_info(&self, task: &MoRef) -> Result<TaskInfo> {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .get(task)
            .cloned()
            .ok_or_else(|| not_found(&task.to_string()))
    }

    async fn list_categories(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let State {
            categories,
            hidden_categories,
            ..
        } = &mut *state;
        Ok(categories
            .values()
            .filter(|c| !take_hidden(hidden_categories, &c.name))
            .map(|c| c.id.clone())
            .collect())
    }

    async fn category(&self, id: &str) -> Result<Category> {
        let state = self.state.lock().unwrap();
        state.categories.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn create_category(&self, category: &Category) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.categories.values().any(|c| c.name == category.name) {
            return Err(OperatorError::Platform(format!(
                "category {} already exists",
                category.name
            )));
        }
        let id = state.id("category");
        let mut stored = category.clone();
        stored.id = id.clone();
        state.categories.insert(id.clone(), stored);
        Ok(id)
    }

    async fn list_tags_for_category(&self, category_id: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let State { tags, hidden_tags, .. } = &mut *state;
        Ok(tags
            .values()
            .filter(|t| t.category_id == category_id)
            .filter(|t| !take_hidden(hidden_tags, &t.name))
            .map(|t| t.id.clone())
            .collect())
    }

    async fn tag(&self, id: &str) -> Result<Tag> {
        let state = self.state.lock().unwrap();
        state.tags.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn create_tag(&self, tag: &Tag) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state
            .tags
            .values()
            .any(|t| t.name == tag.name && t.category_id == tag.category_id)
        {
            return Err(OperatorError::Platform(format!("tag {} already exists", tag.name)));
        }
        let id = state.id("tag");
        let mut stored = tag.clone();
        stored.id = id.clone();
        state.tags.insert(id.clone(), stored);
        Ok(id)
    }

    async fn attach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.tags.contains_key(tag_id) {
            return Err(not_found(tag_id));
        }
        state.attachments.insert((tag_id.to_string(), object.clone()));
        Ok(())
    }

    async fn attached_tags(&self, object: &MoRef) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .attachments
            .iter()
            .filter(|(_, o)| o == object)
            .map(|(t, _)| t.clone())
            .collect())
    }

    async fn attached_objects(&self, tag_id: &str) -> Result<Vec<MoRef>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .attachments
            .iter()
            .filter(|(t, _)| t == tag_id)
            .map(|(_, o)| o.clone())
            .collect())
    }
}
