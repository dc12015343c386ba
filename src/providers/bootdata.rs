//! Guest-info boot data for new instances.
//!
//! The user data payload comes from the node class template when one is set,
//! otherwise from the generated distribution cloud-config. Every payload is
//! base64-encoded exactly once.

use super::cloud_config::{rke2_cloud_config, InitData};
use crate::crd::{UserDataType, VsphereNodeClass};
use crate::error::{OperatorError, Result};
use crate::kube_store::KubeStore;
use crate::options::KubeDistro;
use crate::vsphere::GuestInfoEntry;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Taint;
use minijinja::{Environment, UndefinedBehavior};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const GUESTINFO_USERDATA: &str = "guestinfo.userdata";
pub const GUESTINFO_USERDATA_ENCODING: &str = "guestinfo.userdata.encoding";
pub const GUESTINFO_IGNITION: &str = "guestinfo.ignition.config.data";
pub const GUESTINFO_IGNITION_ENCODING: &str = "guestinfo.ignition.config.data.encoding";
pub const GUESTINFO_METADATA: &str = "guestinfo.metadata";
pub const GUESTINFO_METADATA_ENCODING: &str = "guestinfo.metadata.encoding";

const ENCODING_BASE64: &str = "base64";

/// Strips every layer of base64 from `data`, then encodes it once
pub fn encode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut plain = data.to_vec();
    while let Ok(decoded) = STANDARD.decode(&plain) {
        if decoded.is_empty() {
            break;
        }
        plain = decoded;
    }
    STANDARD.encode(plain)
}

/// Cluster-wide bootstrap settings
#[derive(Debug, Clone, Default)]
pub struct BootSettings {
    pub distro: Option<KubeDistro>,
    pub kube_version: String,
    pub cluster_endpoint: String,
    pub join_token: String,
}

#[derive(Clone)]
pub struct BootDataBuilder {
    kube: Arc<dyn KubeStore>,
    settings: BootSettings,
}

impl BootDataBuilder {
    pub fn new(kube: Arc<dyn KubeStore>, settings: BootSettings) -> Self {
        Self { kube, settings }
    }

    /// Guest-info entries for a VM named `vm_name`
    pub async fn build(
        &self,
        class: &VsphereNodeClass,
        vm_name: &str,
        taints: &[Taint],
    ) -> Result<Vec<GuestInfoEntry>> {
        let user_data = &class.spec.user_data;
        let payload = if !user_data.template_base64.is_empty() {
            self.render_template(class).await?
        } else {
            match (self.settings.distro, user_data.r#type) {
                (Some(_), UserDataType::CloudInit) => {
                    let init = InitData {
                        distro: self.settings.distro,
                        kube_version: self.settings.kube_version.clone(),
                        api_endpoint: self.settings.cluster_endpoint.clone(),
                        token: self.settings.join_token.clone(),
                        taints: taints.to_vec(),
                        additional_cloud_config: user_data.additional_cloud_config.clone(),
                    };
                    rke2_cloud_config(&init)?.render()?
                }
                (Some(_), UserDataType::Ignition) => {
                    return Err(OperatorError::BootData(
                        "ignition user data requires templateBase64".to_string(),
                    ))
                }
                (None, _) => {
                    return Err(OperatorError::BootData(
                        "no user data template and no kube distro configured".to_string(),
                    ))
                }
            }
        };

        let (data_key, encoding_key) = match user_data.r#type {
            UserDataType::CloudInit => (GUESTINFO_USERDATA, GUESTINFO_USERDATA_ENCODING),
            UserDataType::Ignition => (GUESTINFO_IGNITION, GUESTINFO_IGNITION_ENCODING),
        };
        let metadata = format!("local-hostname: \"{}\"", vm_name);
        Ok(vec![
            GuestInfoEntry::new(data_key, encode(payload.as_bytes())),
            GuestInfoEntry::new(encoding_key, ENCODING_BASE64),
            GuestInfoEntry::new(GUESTINFO_METADATA, encode(metadata.as_bytes())),
            GuestInfoEntry::new(GUESTINFO_METADATA_ENCODING, ENCODING_BASE64),
        ])
    }

    async fn render_template(&self, class: &VsphereNodeClass) -> Result<String> {
        let user_data = &class.spec.user_data;
        let template = STANDARD
            .decode(user_data.template_base64.trim())
            .map_err(|e| OperatorError::BootData(format!("failed to decode user data template: {}", e)))?;
        let template = String::from_utf8(template)
            .map_err(|e| OperatorError::BootData(format!("user data template is not UTF-8: {}", e)))?;

        let values: BTreeMap<String, String> = match &user_data.values {
            Some(secret) => self
                .kube
                .get_secret_data(&secret.namespace, &secret.name)
                .await
                .map_err(|e| {
                    OperatorError::BootData(format!("failed to get user data values secret: {}", e))
                })?,
            None => BTreeMap::new(),
        };

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.render_str(&template, &values)
            .map_err(|e| OperatorError::BootData(format!("failed to execute user data template: {}", e)))
    }
}
