//! cloud-config generation for agent-based distributions.

use crate::error::{OperatorError, Result};
use crate::options::KubeDistro;
use k8s_openapi::api::core::v1::Taint;
use minijinja::Environment;
use serde::{Deserialize, Serialize};

const RKE2_CONFIG_PATH: &str = "/etc/rancher/rke2/config.yaml";

const RKE2_CONFIG_TEMPLATE: &str = r#"server: {{ api_endpoint }}
kubelet-arg:
  - --cloud-provider=external
token: {{ token }}
{%- if taints %}
node-taints:
{%- for taint in taints %}
  - {{ taint }}
{%- endfor %}
{%- endif %}
"#;

/// Inputs for generating a node's bootstrap configuration
#[derive(Debug, Clone, Default)]
pub struct InitData {
    pub distro: Option<KubeDistro>,
    pub kube_version: String,
    pub api_endpoint: String,
    pub token: String,
    pub taints: Vec<Taint>,
    /// write_files/runcmd fragment appended to the generated document
    pub additional_cloud_config: String,
}

/// The subset of cloud-config this provider generates and merges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    #[serde(default)]
    pub write_files: Vec<WriteFile>,
    #[serde(default)]
    pub runcmd: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFile {
    pub path: String,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub content: String,
}

impl CloudConfig {
    pub fn merge(&mut self, extra: CloudConfig) {
        self.write_files.extend(extra.write_files);
        self.runcmd.extend(extra.runcmd);
    }

    /// Renders the document with its `#cloud-config` header
    pub fn render(&self) -> Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

/// `key=value:Effect`, or `key:Effect` when the value is empty
pub fn format_taint(taint: &Taint) -> String {
    match taint.value.as_deref() {
        Some(value) if !value.is_empty() => format!("{}={}:{}", taint.key, value, taint.effect),
        _ => format!("{}:{}", taint.key, taint.effect),
    }
}

/// Builds the RKE2 agent cloud-config and merges the additional fragment.
///
/// A fragment that does not strictly parse fails the whole build.
pub fn rke2_cloud_config(data: &InitData) -> Result<CloudConfig> {
    let taints: Vec<String> = data.taints.iter().map(format_taint).collect();
    let env = Environment::new();
    let agent_config = env
        .render_str(
            RKE2_CONFIG_TEMPLATE,
            minijinja::context! {
                api_endpoint => data.api_endpoint,
                token => data.token,
                taints => taints,
            },
        )
        .map_err(|e| OperatorError::BootData(format!("failed to render RKE2 config: {}", e)))?;

    let install = if data.distro == Some(KubeDistro::Rke2AirGapped) {
        r#"INSTALL_RKE2_ARTIFACT_PATH=/opt/rke2-artifacts INSTALL_RKE2_TYPE="agent" sh /opt/install.sh"#
            .to_string()
    } else {
        format!(
            r#"curl -sfL https://get.rke2.io | INSTALL_RKE2_VERSION={} INSTALL_RKE2_TYPE="agent" sh -s"#,
            data.kube_version
        )
    };

    let mut config = CloudConfig {
        write_files: vec![WriteFile {
            path: RKE2_CONFIG_PATH.to_string(),
            permissions: "0640".to_string(),
            owner: "root:root".to_string(),
            content: agent_config,
        }],
        runcmd: vec![
            "sleep 10".to_string(),
            install,
            "systemctl enable rke2-agent.service".to_string(),
            "systemctl start rke2-agent.service".to_string(),
        ],
    };

    if !data.additional_cloud_config.trim().is_empty() {
        let extra: CloudConfig = serde_yaml::from_str(&data.additional_cloud_config).map_err(|e| {
            OperatorError::BootData(format!("failed to parse additional cloud config: {}", e))
        })?;
        config.merge(extra);
    }
    Ok(config)
}
