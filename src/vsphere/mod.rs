//! vSphere platform model and API seam.
//!
//! Everything above this module talks to the platform through
//! [`VsphereApi`]. Object references returned by lookups are classified into
//! [`PlatformObject`] so callers match on the kind instead of trusting it.

pub mod client;
#[cfg(test)]
pub mod fake;

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub use client::{VsphereClient, VsphereConfig};

/// How often a pending task is polled
pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Managed object reference, e.g. `VirtualMachine:vm-42`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MoRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl MoRef {
    pub fn new(kind: &str, value: &str) -> Self {
        Self {
            kind: kind.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for MoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Object kinds the resolver can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Datacenter,
    ResourcePool,
    Datastore,
    Network,
    VirtualMachine,
    Folder,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Datacenter => "Datacenter",
            ObjectKind::ResourcePool => "ResourcePool",
            ObjectKind::Datastore => "Datastore",
            ObjectKind::Network => "Network",
            ObjectKind::VirtualMachine => "VirtualMachine",
            ObjectKind::Folder => "Folder",
        };
        f.write_str(s)
    }
}

/// A classified object reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformObject {
    Datacenter(MoRef),
    ResourcePool(MoRef),
    Datastore(MoRef),
    Network(MoRef),
    VirtualMachine(MoRef),
    Folder(MoRef),
    Other(MoRef),
}

impl From<MoRef> for PlatformObject {
    fn from(reference: MoRef) -> Self {
        match reference.kind.as_str() {
            "Datacenter" => PlatformObject::Datacenter(reference),
            "ResourcePool" => PlatformObject::ResourcePool(reference),
            "Datastore" => PlatformObject::Datastore(reference),
            "Network" | "DistributedVirtualPortgroup" | "OpaqueNetwork" => {
                PlatformObject::Network(reference)
            }
            "VirtualMachine" => PlatformObject::VirtualMachine(reference),
            "Folder" => PlatformObject::Folder(reference),
            _ => PlatformObject::Other(reference),
        }
    }
}

impl PlatformObject {
    pub fn kind(&self) -> Option<ObjectKind> {
        match self {
            PlatformObject::Datacenter(_) => Some(ObjectKind::Datacenter),
            PlatformObject::ResourcePool(_) => Some(ObjectKind::ResourcePool),
            PlatformObject::Datastore(_) => Some(ObjectKind::Datastore),
            PlatformObject::Network(_) => Some(ObjectKind::Network),
            PlatformObject::VirtualMachine(_) => Some(ObjectKind::VirtualMachine),
            PlatformObject::Folder(_) => Some(ObjectKind::Folder),
            PlatformObject::Other(_) => None,
        }
    }

    pub fn reference(&self) -> &MoRef {
        match self {
            PlatformObject::Datacenter(r)
            | PlatformObject::ResourcePool(r)
            | PlatformObject::Datastore(r)
            | PlatformObject::Network(r)
            | PlatformObject::VirtualMachine(r)
            | PlatformObject::Folder(r)
            | PlatformObject::Other(r) => r,
        }
    }

    pub fn is(&self, kind: ObjectKind) -> bool {
        self.kind() == Some(kind)
    }
}

/// A named object found in the inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    pub reference: MoRef,
    pub name: String,
}

impl InventoryItem {
    pub fn object(&self) -> PlatformObject {
        PlatformObject::from(self.reference.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    #[default]
    PoweredOff,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// A virtual hardware device as returned by the platform, kept in wire form
/// so edits round-trip fields this crate does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualDevice(pub Value);

const ETHERNET_CARD_TYPES: &[&str] = &[
    "VirtualE1000",
    "VirtualE1000e",
    "VirtualPCNet32",
    "VirtualVmxnet",
    "VirtualVmxnet2",
    "VirtualVmxnet3",
    "VirtualVmxnet3Vrdma",
    "VirtualSriovEthernetCard",
];

impl VirtualDevice {
    pub fn type_name(&self) -> &str {
        self.0.get("_typeName").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn key(&self) -> i64 {
        self.0.get("key").and_then(Value::as_i64).unwrap_or_default()
    }

    pub fn is_disk(&self) -> bool {
        self.type_name() == "VirtualDisk"
    }

    pub fn is_ethernet_card(&self) -> bool {
        ETHERNET_CARD_TYPES.contains(&self.type_name())
    }

    pub fn capacity_in_kb(&self) -> i64 {
        self.0.get("capacityInKB").and_then(Value::as_i64).unwrap_or_default()
    }

    pub fn with_capacity_in_kb(&self, capacity_kb: i64) -> VirtualDevice {
        let mut raw = self.0.clone();
        if let Value::Object(map) = &mut raw {
            map.insert("capacityInKB".to_string(), Value::from(capacity_kb));
            // the byte field wins over the KB field when both are present
            map.remove("capacityInBytes");
        }
        VirtualDevice(raw)
    }
}

/// Properties of one virtual machine read in a single call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VirtualMachineInfo {
    pub name: String,
    /// BIOS UUID, the identifier carried in provider IDs
    pub uuid: String,
    pub annotation: String,
    pub template: bool,
    pub create_date: Option<DateTime<Utc>>,
    pub power_state: PowerState,
    pub devices: Vec<VirtualDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOperation {
    Add,
    Remove,
    Edit,
}

impl fmt::Display for DeviceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceOperation::Add => "add",
            DeviceOperation::Remove => "remove",
            DeviceOperation::Edit => "edit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    pub device: VirtualDevice,
}

/// A `guestinfo.*` extra-config entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfoEntry {
    pub key: String,
    pub value: String,
}

impl GuestInfoEntry {
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelocateSpec {
    pub pool: MoRef,
    pub datastore: MoRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSpec {
    pub name: String,
    pub annotation: String,
    pub num_cpus: i32,
    pub memory_mb: i64,
    pub guest_id: String,
    pub device_change: Vec<DeviceChange>,
    pub extra_config: Vec<GuestInfoEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloneSpec {
    pub location: RelocateSpec,
    pub config: ConfigSpec,
    pub power_on: bool,
}

/// How a new NIC attaches to a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicBacking {
    Network { device_name: String, network: MoRef },
    DistributedPortgroup { switch_uuid: String, portgroup_key: String },
    Opaque { network_id: String, network_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub state: TaskState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cardinality: String,
    #[serde(default)]
    pub associable_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category_id: String,
}

/// Operations the provider needs from vCenter.
///
/// Inventory and task calls go to the VI/JSON API, tagging calls to the
/// Automation REST API. Lookups that can legitimately miss return `None`.
#[async_trait]
pub trait VsphereApi: Send + Sync {
    async fn datacenters(&self) -> Result<Vec<InventoryItem>>;

    async fn find_by_inventory_path(&self, path: &str) -> Result<Option<MoRef>>;

    /// Direct children of the folder at `path`
    async fn list_children(&self, path: &str) -> Result<Vec<InventoryItem>>;

    async fn find_vm_by_uuid(&self, datacenter: &MoRef, uuid: &str) -> Result<Option<MoRef>>;

    async fn virtual_machine(&self, vm: &MoRef) -> Result<VirtualMachineInfo>;

    async fn object_name(&self, reference: &MoRef) -> Result<String>;

    async fn network_backing(&self, network: &MoRef) -> Result<NicBacking>;

    /// Starts a clone and returns the task reference
    async fn clone_vm(
        &self,
        template: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<MoRef>;

    async fn power_off_vm(&self, vm: &MoRef) -> Result<MoRef>;

    async fn destroy(&self, vm: &MoRef) -> Result<MoRef>;

    async fn task_info(&self, task: &MoRef) -> Result<TaskInfo>;

    async fn list_categories(&self) -> Result<Vec<String>>;

    async fn category(&self, id: &str) -> Result<Category>;

    async fn create_category(&self, category: &Category) -> Result<String>;

    async fn list_tags_for_category(&self, category_id: &str) -> Result<Vec<String>>;

    async fn tag(&self, id: &str) -> Result<Tag>;

    async fn create_tag(&self, tag: &Tag) -> Result<String>;

    async fn attach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()>;

    async fn attached_tags(&self, object: &MoRef) -> Result<Vec<String>>;

    async fn attached_objects(&self, tag_id: &str) -> Result<Vec<MoRef>>;
}

/// Polls `task` until it leaves the queued/running states.
pub async fn wait_for_task(api: &dyn VsphereApi, task: &MoRef) -> Result<()> {
    loop {
        let info = api.task_info(task).await?;
        match info.state {
            TaskState::Success => return Ok(()),
            TaskState::Error => {
                return Err(OperatorError::Platform(
                    info.error.unwrap_or_else(|| format!("task {} failed", task)),
                ))
            }
            TaskState::Queued | TaskState::Running => tokio::time::sleep(TASK_POLL_INTERVAL).await,
        }
    }
}

/// Whether `task` has finished, either way
pub async fn task_finished(api: &dyn VsphereApi, task: &MoRef) -> Result<bool> {
    let info = api.task_info(task).await?;
    Ok(matches!(info.state, TaskState::Success | TaskState::Error))
}
