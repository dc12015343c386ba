//! Instance provisioning on vSphere.
//!
//! An instance is a VM cloned from the node class image. Everything an
//! [`Instance`] carries is read back from the platform on every call: the
//! owning node pool and class come from tags, the image from the annotation
//! written at clone time.

use super::bootdata::BootDataBuilder;
use super::devices::clone_device_changes;
use super::finder::{folder_path, Finder};
use super::tags::TagManager;
use crate::crd::labels::{
    CLUSTER_NAME_TAG_KEY, LABEL_INSTANCE_CPU, LABEL_INSTANCE_MEMORY, LABEL_INSTANCE_SIZE,
    LABEL_NODECLASS, LABEL_TOPOLOGY_ZONE, NODEPOOL_LABEL_KEY,
};
use crate::crd::{NodeClaim, VsphereNodeClass};
use crate::error::{OperatorError, Result};
use crate::scheduling::{quantity, InstanceType};
use crate::vsphere::{
    task_finished, wait_for_task, CloneSpec, ConfigSpec, InventoryItem, MoRef, ObjectKind,
    PowerState, RelocateSpec, VirtualMachineInfo, VsphereApi, TASK_POLL_INTERVAL,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const GUEST_ID: &str = "otherLinux64Guest";
const CLONED_FROM_PREFIX: &str = "cloned_from:";
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// A VM as seen by the cloud provider
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// BIOS UUID
    pub id: String,
    pub name: String,
    pub image: String,
    pub instance_type: String,
    pub zone: String,
    pub node_pool: String,
    pub node_class: String,
    pub power_state: PowerState,
    pub created_at: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    fn from_platform(info: VirtualMachineInfo, tags: BTreeMap<String, String>) -> Self {
        let tag = |key: &str| tags.get(key).cloned().unwrap_or_default();
        Self {
            id: info.uuid,
            name: info.name,
            image: info
                .annotation
                .strip_prefix(CLONED_FROM_PREFIX)
                .unwrap_or_default()
                .to_string(),
            instance_type: tag(LABEL_INSTANCE_SIZE),
            zone: tag(LABEL_TOPOLOGY_ZONE),
            node_pool: tag(NODEPOOL_LABEL_KEY),
            node_class: tag(LABEL_NODECLASS),
            power_state: info.power_state,
            created_at: info.create_date,
            tags,
        }
    }
}

/// Create/get/list/delete of instances
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Launches the first of `instance_types` for `claim`
    async fn create(
        &self,
        class: &VsphereNodeClass,
        claim: &NodeClaim,
        instance_types: &[InstanceType],
    ) -> Result<Instance>;

    async fn get(&self, id: &str) -> Result<Instance>;

    async fn list(&self) -> Result<Vec<Instance>>;

    /// Powers off and destroys the instance. A missing instance is
    /// [`OperatorError::InstanceNotFound`].
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Where this provider's VMs live
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub cluster_name: String,
    /// VM folder under the datacenter `vm` folder
    pub folder: String,
    /// Datacenter for listing and lookups by id; the only one when unset
    pub datacenter: Option<String>,
    pub zone: Option<String>,
}

impl ProviderSettings {
    pub fn vm_name(&self, claim_name: &str) -> String {
        format!("{}{}", self.vm_name_prefix(), claim_name)
    }

    fn vm_name_prefix(&self) -> String {
        format!("{}-karp-", self.cluster_name)
    }
}

pub struct DefaultProvider {
    api: Arc<dyn VsphereApi>,
    finder: Finder,
    tags: TagManager,
    boot: BootDataBuilder,
    settings: ProviderSettings,
}

impl DefaultProvider {
    pub fn new(api: Arc<dyn VsphereApi>, boot: BootDataBuilder, settings: ProviderSettings) -> Self {
        Self {
            finder: Finder::new(api.clone()),
            tags: TagManager::new(api.clone()),
            api,
            boot,
            settings,
        }
    }

    fn instance_tags(
        &self,
        class: &VsphereNodeClass,
        claim: &NodeClaim,
        instance_type: &InstanceType,
        cpus: i32,
        memory_mib: i64,
    ) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::from([
            (CLUSTER_NAME_TAG_KEY.to_string(), self.settings.cluster_name.clone()),
            (LABEL_NODECLASS.to_string(), class.name_any()),
            (LABEL_INSTANCE_SIZE.to_string(), instance_type.name.clone()),
            (LABEL_INSTANCE_CPU.to_string(), cpus.to_string()),
            (LABEL_INSTANCE_MEMORY.to_string(), memory_mib.to_string()),
        ]);
        if let Some(pool) = claim.labels().get(NODEPOOL_LABEL_KEY) {
            tags.insert(NODEPOOL_LABEL_KEY.to_string(), pool.clone());
        }
        if let Some(zone) = self.settings.zone.as_ref().filter(|z| !z.is_empty()) {
            tags.insert(LABEL_TOPOLOGY_ZONE.to_string(), zone.clone());
        }
        for (key, value) in &class.spec.tags {
            tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
        tags
    }

    /// Polls until the cloned VM is resolvable by path. A clone task that
    /// finishes without producing the VM is an error.
    async fn await_clone_object(&self, path: &str, task: &MoRef) -> Result<MoRef> {
        loop {
            if let Some(vm) = self.api.find_by_inventory_path(path).await? {
                return Ok(vm);
            }
            if task_finished(self.api.as_ref(), task).await? {
                wait_for_task(self.api.as_ref(), task).await?;
                if let Some(vm) = self.api.find_by_inventory_path(path).await? {
                    return Ok(vm);
                }
                return Err(OperatorError::Platform(format!(
                    "clone task {} finished but {} was not found",
                    task, path
                )));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    async fn datacenter(&self) -> Result<InventoryItem> {
        self.finder
            .default_datacenter(self.settings.datacenter.as_deref())
            .await
    }

    async fn find_vm(&self, id: &str) -> Result<MoRef> {
        let dc = self.datacenter().await?;
        self.api
            .find_vm_by_uuid(&dc.reference, id)
            .await?
            .ok_or_else(|| OperatorError::InstanceNotFound(id.to_string()))
    }

    async fn describe(&self, vm: &MoRef) -> Result<Instance> {
        let info = self.api.virtual_machine(vm).await?;
        let tags = self.tags.tags_of(vm).await?;
        Ok(Instance::from_platform(info, tags))
    }

    async fn owned_instance(&self, vm: &MoRef) -> Result<Option<Instance>> {
        let info = self.api.virtual_machine(vm).await?;
        if info.template {
            return Ok(None);
        }
        let tags = self.tags.tags_of(vm).await?;
        let tagged = tags.get(CLUSTER_NAME_TAG_KEY) == Some(&self.settings.cluster_name);
        if !tagged && !info.name.starts_with(&self.settings.vm_name_prefix()) {
            return Ok(None);
        }
        Ok(Some(Instance::from_platform(info, tags)))
    }
}

fn cpu_count(instance_type: &InstanceType) -> Result<i32> {
    let cpu = instance_type
        .cpu()
        .ok_or_else(|| OperatorError::InvalidState(format!("instance type {} has no cpu", instance_type.name)))?;
    Ok(quantity::value(cpu)?.ceil() as i32)
}

fn memory_mib(instance_type: &InstanceType) -> Result<i64> {
    let memory = instance_type.memory().ok_or_else(|| {
        OperatorError::InvalidState(format!("instance type {} has no memory", instance_type.name))
    })?;
    Ok((quantity::value(memory)? / BYTES_PER_MIB).ceil() as i64)
}

#[async_trait]
impl InstanceProvider for DefaultProvider {
    async fn create(
        &self,
        class: &VsphereNodeClass,
        claim: &NodeClaim,
        instance_types: &[InstanceType],
    ) -> Result<Instance> {
        let instance_type = instance_types.first().ok_or_else(|| {
            OperatorError::InsufficientCapacity("no instance types to launch".to_string())
        })?;
        let target = self.finder.resolve_target(&class.spec).await?;
        let folder = self.finder.folder(&target.datacenter, &self.settings.folder).await?;

        let name = self.settings.vm_name(&claim.name_any());
        let cpus = cpu_count(instance_type)?;
        let memory = memory_mib(instance_type)?;

        let template = self.api.virtual_machine(&target.image.reference).await?;
        let backing = self.api.network_backing(&target.network.reference).await?;
        let device_change = clone_device_changes(&template.devices, &backing, class.spec.disk_size_gib)?;

        let taints: Vec<_> = claim
            .spec
            .taints
            .iter()
            .chain(claim.spec.startup_taints.iter())
            .cloned()
            .collect();
        let extra_config = self.boot.build(class, &name, &taints).await?;

        let spec = CloneSpec {
            location: RelocateSpec {
                pool: target.pool.clone(),
                datastore: target.datastore.clone(),
            },
            config: ConfigSpec {
                name: name.clone(),
                annotation: format!("{}{}", CLONED_FROM_PREFIX, target.image.name),
                num_cpus: cpus,
                memory_mb: memory,
                guest_id: GUEST_ID.to_string(),
                device_change,
                extra_config,
            },
            power_on: true,
        };

        info!(
            name = %name,
            image = %target.image.name,
            instance_type = %instance_type.name,
            "Cloning instance"
        );
        let task = self
            .api
            .clone_vm(&target.image.reference, &folder.reference, &name, &spec)
            .await?;

        let vm_path = format!("{}/{}", folder.name, name);
        let vm = self.await_clone_object(&vm_path, &task).await?;
        let tags = self.instance_tags(class, claim, instance_type, cpus, memory);
        self.tags.tag_object(&vm, &tags).await?;
        let instance = self.describe(&vm).await?;

        wait_for_task(self.api.as_ref(), &task).await?;
        debug!(name = %name, id = %instance.id, "Instance created");
        Ok(instance)
    }

    async fn get(&self, id: &str) -> Result<Instance> {
        let vm = self.find_vm(id).await?;
        self.describe(&vm).await
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let dc = self.datacenter().await?;
        let path = folder_path(&dc, &self.settings.folder);
        let mut instances = Vec::new();
        for child in self.api.list_children(&path).await? {
            if !child.object().is(ObjectKind::VirtualMachine) {
                continue;
            }
            match self.owned_instance(&child.reference).await {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => {}
                Err(e) => warn!(vm = %child.reference, error = %e, "Skipping instance"),
            }
        }
        Ok(instances)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let vm = self.find_vm(id).await?;
        let info = self.api.virtual_machine(&vm).await?;
        if info.power_state != PowerState::PoweredOff {
            let task = self.api.power_off_vm(&vm).await?;
            wait_for_task(self.api.as_ref(), &task).await?;
        }
        let task = self.api.destroy(&vm).await?;
        wait_for_task(self.api.as_ref(), &task).await?;
        info!(name = %info.name, id = %id, "Instance deleted");
        Ok(())
    }
}
