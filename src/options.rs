//! Process options.
//!
//! Every flag can also be set through the environment so the provider runs
//! unchanged from a Deployment manifest.

use crate::error::{OperatorError, Result};
use crate::providers::{BootSettings, ProviderSettings};
use crate::vsphere::VsphereConfig;
use clap::Parser;
use std::fmt;
use std::str::FromStr;

/// Agent distribution installed by generated boot data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeDistro {
    Rke2,
    Rke2AirGapped,
}

impl FromStr for KubeDistro {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rke2" => Ok(KubeDistro::Rke2),
            "rke2airgapped" => Ok(KubeDistro::Rke2AirGapped),
            other => Err(OperatorError::Configuration(format!(
                "unsupported kube distro {:?}, expected rke2 or rke2airgapped",
                other
            ))),
        }
    }
}

impl fmt::Display for KubeDistro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KubeDistro::Rke2 => f.write_str("rke2"),
            KubeDistro::Rke2AirGapped => f.write_str("rke2airgapped"),
        }
    }
}

/// Karpenter cloud provider for vSphere
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "karpenter-provider-vsphere")]
#[command(version, about = "Karpenter cloud provider for vSphere")]
pub struct Options {
    /// Cluster name, used in VM names and the cluster tag
    #[arg(long, env = "CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// API endpoint new nodes join
    #[arg(long, env = "CLUSTER_ENDPOINT", default_value = "")]
    pub cluster_endpoint: String,

    /// Node join token
    #[arg(long, env = "JOIN_TOKEN", default_value = "", hide_env_values = true)]
    pub join_token: String,

    /// Distribution installed by generated boot data (rke2, rke2airgapped)
    #[arg(long, env = "KUBE_DISTRO", default_value = "")]
    pub kube_distro: String,

    /// Distribution version, required for rke2
    #[arg(long, env = "KUBE_VERSION", default_value = "")]
    pub kube_version: String,

    /// vCenter URL
    #[arg(long, env = "GOVC_URL", default_value = "")]
    pub vsphere_endpoint: String,

    #[arg(long, env = "GOVC_USERNAME", default_value = "")]
    pub vsphere_username: String,

    #[arg(long, env = "GOVC_PASSWORD", default_value = "", hide_env_values = true)]
    pub vsphere_password: String,

    /// Skip TLS verification of the vCenter certificate
    #[arg(long, env = "GOVC_INSECURE", default_value = "false")]
    pub vsphere_insecure: bool,

    /// VM folder, relative to the datacenter VM folder, nodes are cloned into
    #[arg(long, env = "VSPHERE_FOLDER", default_value = "")]
    pub vsphere_path: String,

    /// Datacenter holding the node folder; the only datacenter when empty
    #[arg(long, env = "VSPHERE_DATACENTER", default_value = "")]
    pub vsphere_datacenter: String,

    /// Zone written to instances and offerings
    #[arg(long, env = "VSPHERE_ZONE", default_value = "")]
    pub vsphere_zone: String,

    /// VI/JSON API release
    #[arg(long, env = "VSPHERE_API_RELEASE", default_value = "8.0.2.0")]
    pub vsphere_api_release: String,

    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    pub leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    pub leader_election_namespace: String,
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.cluster_endpoint.is_empty() {
            return Err(OperatorError::Configuration(
                "cluster endpoint is required".to_string(),
            ));
        }
        if self.cluster_name.is_empty() {
            return Err(OperatorError::Configuration("cluster name is required".to_string()));
        }
        if self.distro()? == Some(KubeDistro::Rke2) && self.kube_version.is_empty() {
            return Err(OperatorError::Configuration(
                "kube version is required for rke2".to_string(),
            ));
        }
        Ok(())
    }

    pub fn distro(&self) -> Result<Option<KubeDistro>> {
        if self.kube_distro.is_empty() {
            return Ok(None);
        }
        self.kube_distro.parse().map(Some)
    }

    pub fn zone(&self) -> Option<&str> {
        Some(self.vsphere_zone.as_str()).filter(|z| !z.is_empty())
    }

    pub fn vsphere_config(&self) -> VsphereConfig {
        VsphereConfig {
            endpoint: self.vsphere_endpoint.clone(),
            username: self.vsphere_username.clone(),
            password: self.vsphere_password.clone(),
            insecure: self.vsphere_insecure,
            api_release: self.vsphere_api_release.clone(),
        }
    }

    pub fn boot_settings(&self) -> Result<BootSettings> {
        Ok(BootSettings {
            distro: self.distro()?,
            kube_version: self.kube_version.clone(),
            cluster_endpoint: self.cluster_endpoint.clone(),
            join_token: self.join_token.clone(),
        })
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            cluster_name: self.cluster_name.clone(),
            folder: self.vsphere_path.clone(),
            datacenter: Some(self.vsphere_datacenter.clone()).filter(|d| !d.is_empty()),
            zone: self.zone().map(str::to_string),
        }
    }
}
