//! Label, annotation, tag and finalizer keys shared across the provider.

/// API group of the node class resource
pub const GROUP: &str = "karpenter.vsphere.com";
/// API group of the upstream scheduler resources
pub const KARPENTER_GROUP: &str = "karpenter.sh";

pub const TERMINATION_FINALIZER: &str = "karpenter.vsphere.com/termination";

pub const ANNOTATION_NODECLASS_HASH: &str = "karpenter.vsphere.com/vspherenodeclass-hash";
pub const ANNOTATION_NODECLASS_HASH_VERSION: &str =
    "karpenter.vsphere.com/vspherenodeclass-hash-version";
/// Bumped whenever the hashing scheme changes
pub const NODECLASS_HASH_VERSION: &str = "v1";

pub const LABEL_NODECLASS: &str = "karpenter.vsphere.com/vspherenodeclass";
pub const LABEL_INSTANCE_CPU: &str = "karpenter.vsphere.com/instance-cpu";
pub const LABEL_INSTANCE_MEMORY: &str = "karpenter.vsphere.com/instance-memory";
pub const LABEL_INSTANCE_SIZE: &str = "karpenter.vsphere.com/instance-size";

pub const CLUSTER_NAME_TAG_KEY: &str = "karpenter.sh/clustername";
pub const NODEPOOL_LABEL_KEY: &str = "karpenter.sh/nodepool";
pub const CAPACITY_TYPE_LABEL_KEY: &str = "karpenter.sh/capacity-type";
pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";

pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
pub const LABEL_ARCH: &str = "kubernetes.io/arch";
pub const LABEL_OS: &str = "kubernetes.io/os";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";

/// Category name the vSphere cloud controller expects for the zone label
pub const ZONE_TAG_CATEGORY: &str = "k8s-zone";

/// Provider ID scheme
pub const PROVIDER_ID_SCHEME: &str = "vsphere";

/// Labels the upstream scheduler always knows how to satisfy
pub const BASE_WELL_KNOWN_LABELS: &[&str] = &[
    LABEL_TOPOLOGY_ZONE,
    LABEL_TOPOLOGY_REGION,
    LABEL_INSTANCE_TYPE,
    LABEL_ARCH,
    LABEL_OS,
    LABEL_HOSTNAME,
    NODEPOOL_LABEL_KEY,
    CAPACITY_TYPE_LABEL_KEY,
    "node.kubernetes.io/windows-build",
];
