//! VsphereNodeClass Custom Resource Definition
//!
//! Describes where and how VM-backed nodes are provisioned: the platform
//! objects to clone into (by name or by tag), the instance types offered to
//! the scheduler, and the boot data handed to the guest.

use crate::conditions::{CONDITION_READY, CONDITION_TRUE, KUBERNETES_VERSION_READY};
use crate::error::{OperatorError, Result};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// VsphereNodeClass is the Schema for the vspherenodeclasses API
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "karpenter.vsphere.com",
    version = "v1alpha1",
    kind = "VsphereNodeClass",
    plural = "vspherenodeclasses",
    derive = "PartialEq",
    status = "VsphereNodeClassStatus",
    shortname = "vspherenc",
    shortname = "vspherencs",
    category = "karpenter",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VsphereNodeClassSpec {
    /// Datacenter holding the compute cluster; the only datacenter when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<SelectorTerm>,

    /// Compute cluster whose root resource pool receives new VMs
    #[serde(default)]
    pub compute_cluster: SelectorTerm,

    /// Datastore for the cloned disks
    #[serde(default)]
    pub datastore: SelectorTerm,

    /// Network the single NIC is attached to
    #[serde(default)]
    pub network: SelectorTerm,

    /// VM template to clone
    #[serde(default)]
    pub image: ImageSelectorTerm,

    /// Primary disk size in GiB; 0 keeps the template's size
    #[serde(default, rename = "diskSizeGiB")]
    pub disk_size_gib: u64,

    /// Instance types offered to the scheduler, in preference order
    #[serde(default)]
    pub instance_types: Vec<InstanceTypeDefinition>,

    /// Guest bootstrap configuration
    #[serde(default)]
    pub user_data: UserData,

    /// Extra tags attached to every VM
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Locates one platform object either by name or by a set of tags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectorTerm {
    /// Inventory name, or an absolute inventory path when it starts with `/`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Category to tag-name map; an object must carry every entry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Locates a VM template either by an inventory glob or by tags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSelectorTerm {
    /// Inventory path glob, relative to the datacenter VM folder unless absolute
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// A single instance type offered by the node class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeDefinition {
    pub name: String,
    /// CPU quantity, e.g. "4"
    pub cpu: String,
    /// Memory quantity, e.g. "8Gi"
    pub memory: String,
    #[serde(default = "default_max_pods")]
    pub max_pods: String,
    /// Ephemeral storage quantity
    #[serde(default)]
    pub storage: String,
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default = "default_arch")]
    pub arch: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UserDataType {
    #[default]
    #[serde(rename = "cloud-init")]
    CloudInit,
    #[serde(rename = "ignition")]
    Ignition,
}

/// Guest bootstrap configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    #[serde(default)]
    pub r#type: UserDataType,

    /// Base64 encoded template rendered with the values secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_base64: String,

    /// Secret whose data keys are exposed to the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<SecretReference>,

    /// write_files/runcmd fragment merged into the generated cloud-config
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub additional_cloud_config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(default = "default_secret_namespace")]
    pub namespace: String,
}

/// Status of the VsphereNodeClass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VsphereNodeClassStatus {
    /// Discovered control-plane version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Status condition following Kubernetes API conventions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_max_pods() -> String {
    "110".to_string()
}

fn default_os() -> String {
    "linux".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

fn default_secret_namespace() -> String {
    "default".to_string()
}

impl VsphereNodeClass {
    /// Stable content hash of the spec. Sequences hash as sets and
    /// zero-valued fields are ignored.
    pub fn hash(&self) -> String {
        let value = serde_json::to_value(&self.spec).unwrap_or(Value::Null);
        let digest = digest_value(&value).unwrap_or_else(|| Sha256::digest(b"").into());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(first).to_string()
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.r#type == condition_type)
    }

    /// Aggregate Ready condition; `None` while it has never been computed
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.condition(CONDITION_READY)
    }

    /// Returns the discovered control-plane version, failing unless the
    /// version condition is True for the current generation.
    pub fn get_kubernetes_version(&self) -> Result<String> {
        let condition = self.condition(KUBERNETES_VERSION_READY);
        match condition {
            Some(c) if c.status == CONDITION_TRUE => {
                if c.observed_generation != self.metadata.generation {
                    return Err(OperatorError::InvalidState(format!(
                        "NodeClass condition {} ObservedGeneration {} does not match the NodeClass Generation {}",
                        KUBERNETES_VERSION_READY,
                        c.observed_generation.unwrap_or_default(),
                        self.metadata.generation.unwrap_or_default()
                    )));
                }
            }
            other => {
                return Err(OperatorError::InvalidState(format!(
                    "NodeClass condition {}, is in Ready={}, {}",
                    KUBERNETES_VERSION_READY,
                    other.map(|c| c.status.as_str()).unwrap_or("Unknown"),
                    other.and_then(|c| c.message.as_deref()).unwrap_or_default()
                )));
            }
        }
        let version = self
            .status
            .as_ref()
            .map(|s| s.kubernetes_version.clone())
            .unwrap_or_default();
        if version.is_empty() {
            return Err(OperatorError::InvalidState(format!(
                "NodeClass {} KubernetesVersion is uninitialized",
                self.name_any()
            )));
        }
        Ok(version)
    }
}

// ---- content hash ----

fn digest_value(value: &Value) -> Option<[u8; 32]> {
    let mut hasher = Sha256::new();
    match value {
        Value::Null | Value::Bool(false) => return None,
        Value::Bool(true) => hasher.update(b"b:true"),
        Value::Number(n) => {
            if n.as_f64() == Some(0.0) {
                return None;
            }
            hasher.update(b"n:");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            if s.is_empty() {
                return None;
            }
            hasher.update(b"s:");
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            let mut digests: Vec<[u8; 32]> = items.iter().filter_map(digest_value).collect();
            if digests.is_empty() {
                return None;
            }
            digests.sort_unstable();
            hasher.update(b"a:");
            for d in &digests {
                hasher.update(d);
            }
        }
        Value::Object(map) => {
            let mut fields: Vec<(&String, [u8; 32])> = map
                .iter()
                .filter_map(|(k, v)| digest_value(v).map(|d| (k, d)))
                .collect();
            if fields.is_empty() {
                return None;
            }
            fields.sort_by(|a, b| a.0.cmp(b.0));
            hasher.update(b"o:");
            for (k, d) in &fields {
                hasher.update((k.len() as u64).to_be_bytes());
                hasher.update(k.as_bytes());
                hasher.update(d);
            }
        }
    }
    Some(hasher.finalize().into())
}
