//! Kubernetes API access used by the cloud provider and controllers.
//!
//! Reads and patches go through [`KubeStore`] so reconcile logic can be
//! exercised against a mock.

use crate::crd::{NodeClaim, NodePool, VsphereNodeClass};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::Value;
use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeStore: Send + Sync {
    async fn get_node_class(&self, name: &str) -> Result<VsphereNodeClass>;

    async fn list_node_classes(&self) -> Result<Vec<VsphereNodeClass>>;

    async fn get_node_pool(&self, name: &str) -> Result<NodePool>;

    async fn list_node_claims(&self) -> Result<Vec<NodeClaim>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Deletes a node; a node that is already gone is not an error
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// JSON merge patch on the node class object
    async fn patch_node_class(&self, name: &str, patch: Value) -> Result<()>;

    /// JSON merge patch on the node class status subresource
    async fn patch_node_class_status(&self, name: &str, patch: Value) -> Result<()>;

    /// JSON merge patch on a node claim object
    async fn patch_node_claim(&self, name: &str, patch: Value) -> Result<()>;

    /// Secret data decoded as UTF-8 strings
    async fn get_secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;

    /// API server `gitVersion`, e.g. `v1.31.4+rke2r1`
    async fn server_version(&self) -> Result<String>;
}

/// Production [`KubeStore`] backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeClientStore {
    client: Client,
}

impl KubeClientStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeStore for KubeClientStore {
    async fn get_node_class(&self, name: &str) -> Result<VsphereNodeClass> {
        let api: Api<VsphereNodeClass> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn list_node_classes(&self) -> Result<Vec<VsphereNodeClass>> {
        let api: Api<VsphereNodeClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node_pool(&self, name: &str) -> Result<NodePool> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn list_node_claims(&self) -> Result<Vec<NodeClaim>> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match OperatorError::from(e) {
                OperatorError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn patch_node_class(&self, name: &str, patch: Value) -> Result<()> {
        let api: Api<VsphereNodeClass> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_class_status(&self, name: &str, patch: Value) -> Result<()> {
        let api: Api<VsphereNodeClass> = Api::all(self.client.clone());
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_claim(&self, name: &str, patch: Value) -> Result<()> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        let mut out: BTreeMap<String, String> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect();
        out.extend(secret.string_data.unwrap_or_default());
        Ok(out)
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }
}
