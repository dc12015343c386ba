//! Control-plane version discovery.

use crate::error::Result;
use crate::kube_store::KubeStore;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

pub const KUBERNETES_VERSION_TTL: Duration = Duration::from_secs(15 * 60);

const CACHE_KEY: &str = "kubernetes-version";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubernetesVersionSource: Send + Sync {
    /// Version without the leading `v`, e.g. `1.31.4+rke2r1`
    async fn get(&self) -> Result<String>;
}

/// Reads the API server version and caches it for [`KUBERNETES_VERSION_TTL`]
pub struct KubernetesVersionProvider {
    kube: Arc<dyn KubeStore>,
    cache: Cache<&'static str, String>,
}

impl KubernetesVersionProvider {
    pub fn new(kube: Arc<dyn KubeStore>) -> Self {
        Self {
            kube,
            cache: Cache::builder().time_to_live(KUBERNETES_VERSION_TTL).build(),
        }
    }
}

#[async_trait]
impl KubernetesVersionSource for KubernetesVersionProvider {
    async fn get(&self) -> Result<String> {
        if let Some(version) = self.cache.get(CACHE_KEY).await {
            return Ok(version);
        }
        let git_version = self.kube.server_version().await?;
        let version = git_version.trim_start_matches('v').to_string();
        debug!(version = %version, "Discovered kubernetes version");
        self.cache.insert(CACHE_KEY, version.clone()).await;
        Ok(version)
    }
}
