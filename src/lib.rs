//! Karpenter cloud provider for vSphere
//!
//! Provisions Kubernetes worker nodes as virtual machines cloned from
//! templates, driven by `NodeClaim`s from the upstream scheduler.
//!
//! ## Custom Resources
//!
//! - `VsphereNodeClass`: where and how nodes are launched (placement
//!   selectors, template, disk, instance types and boot data)
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: karpenter.vsphere.com/v1alpha1
//! kind: VsphereNodeClass
//! metadata:
//!   name: default
//! spec:
//!   computeCluster:
//!     name: cluster1
//!   datastore:
//!     name: ds1
//!   network:
//!     name: VM Network
//!   image:
//!     pattern: templates/ubuntu-*
//!   diskSizeGiB: 40
//!   instanceTypes:
//!     - name: medium
//!       cpu: "4"
//!       memory: 8Gi
//! ```

pub mod cloudprovider;
pub mod conditions;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_store;
pub mod leader_election;
pub mod options;
pub mod providers;
pub mod scheduling;
pub mod vsphere;

pub use cloudprovider::{CloudProvider, VsphereCloudProvider};
pub use controllers::{
    GarbageCollector, NodeClassHashController, NodeClassStatusController,
    NodeClassTerminationController,
};
pub use crd::{NodeClaim, NodePool, VsphereNodeClass, VsphereNodeClassSpec, VsphereNodeClassStatus};
pub use error::{OperatorError, Result};
pub use options::Options;
