//! Custom Resource Definitions used by the vSphere provider
//!
//! - VsphereNodeClass: owned by this provider
//! - NodeClaim, NodePool: owned by the upstream scheduler, read and patched here

pub mod karpenter;
pub mod labels;
mod nodeclass;

pub use karpenter::{
    NodeClaim, NodeClaimSpec, NodeClaimStatus, NodeClassReference, NodePool, NodePoolSpec,
    NodeSelectorRequirementWithMinValues, ResourceList, ResourceRequirements,
};
pub use nodeclass::{
    Condition, ImageSelectorTerm, InstanceTypeDefinition, SecretReference, SelectorTerm, UserData,
    UserDataType, VsphereNodeClass, VsphereNodeClassSpec, VsphereNodeClassStatus,
};
