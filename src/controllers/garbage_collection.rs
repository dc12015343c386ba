//! Instance garbage collector
//!
//! Deletes instances of this cluster that no node claim references, along
//! with any node registered for them. Instances younger than the grace
//! period are left alone since their claim may not have been written yet.

use crate::cloudprovider::CloudProvider;
use crate::crd::NodeClaim;
use crate::error::{OperatorError, Result};
use crate::kube_store::KubeStore;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Age an unreferenced instance must reach before it is collected
pub const GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

const MAX_CONCURRENT_DELETES: usize = 100;

/// Passes run on the fast interval before settling on the slow one
const FAST_PASSES: u64 = 20;
const FAST_REQUEUE: Duration = Duration::from_secs(10);
const SLOW_REQUEUE: Duration = Duration::from_secs(2 * 60);

pub struct GarbageCollector {
    kube: Arc<dyn KubeStore>,
    cloud_provider: Arc<dyn CloudProvider>,
    successful: AtomicU64,
}

impl GarbageCollector {
    pub fn new(kube: Arc<dyn KubeStore>, cloud_provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            kube,
            cloud_provider,
            successful: AtomicU64::new(0),
        }
    }

    /// Runs collection passes until the task is dropped
    pub async fn run(self: Arc<Self>) {
        info!("Starting instance.garbagecollection controller");
        loop {
            let requeue = match self.reconcile().await {
                Ok(requeue) => requeue,
                Err(e) => {
                    error!(error = %e, "Garbage collection failed");
                    FAST_REQUEUE
                }
            };
            tokio::time::sleep(requeue).await;
        }
    }

    /// One collection pass. Returns the delay before the next one.
    pub(crate) async fn reconcile(&self) -> Result<Duration> {
        let instances: Vec<NodeClaim> = self
            .cloud_provider
            .list()
            .await?
            .into_iter()
            .filter(|c| c.metadata.deletion_timestamp.is_none())
            .collect();
        let claims = self.kube.list_node_claims().await?;
        let nodes = self.kube.list_nodes().await?;

        let referenced: HashSet<&str> = claims
            .iter()
            .map(NodeClaim::provider_id)
            .filter(|id| !id.is_empty())
            .collect();

        let orphans: Vec<&NodeClaim> = instances
            .iter()
            .filter(|c| !referenced.contains(c.provider_id()) && older_than_grace(c))
            .collect();

        let deletions: Vec<_> = orphans
            .into_iter()
            .map(|orphan| self.collect(orphan, &nodes))
            .collect();
        let errors: Vec<OperatorError> = futures::stream::iter(deletions)
            .buffer_unordered(MAX_CONCURRENT_DELETES)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;
        if let Some(first) = errors.into_iter().next() {
            return Err(first);
        }

        let passes = self.successful.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(if passes <= FAST_PASSES { FAST_REQUEUE } else { SLOW_REQUEUE })
    }

    async fn collect(&self, instance: &NodeClaim, nodes: &[Node]) -> Result<()> {
        let provider_id = instance.provider_id();
        match self.cloud_provider.delete(instance).await {
            Ok(()) => {}
            Err(e) if e.is_instance_not_found() => return Ok(()),
            Err(e) => {
                error!(provider_id, error = %e, "Failed to garbage collect instance");
                return Err(e);
            }
        }
        info!(provider_id, "Garbage collected instance");

        let node = nodes
            .iter()
            .find(|n| n.spec.as_ref().and_then(|s| s.provider_id.as_deref()) == Some(provider_id));
        // Best effort once the instance itself is gone
        if let Some(node) = node {
            let name = node.name_any();
            match self.kube.delete_node(&name).await {
                Ok(()) => debug!(provider_id, node = %name, "Garbage collected node"),
                Err(e) => warn!(provider_id, node = %name, error = %e, "Failed to delete node of collected instance"),
            }
        }
        Ok(())
    }
}

fn older_than_grace(claim: &NodeClaim) -> bool {
    let Some(created) = claim.metadata.creation_timestamp.as_ref() else {
        return false;
    };
    (Utc::now() - created.0)
        .to_std()
        .is_ok_and(|age| age > GRACE_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::MockCloudProvider;
    use crate::crd::NodeClaimStatus;
    use crate::kube_store::MockKubeStore;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn instance(provider_id: &str, age_minutes: i64) -> NodeClaim {
        let mut claim = NodeClaim::new(provider_id, Default::default());
        claim.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::minutes(age_minutes)));
        claim.status = Some(NodeClaimStatus {
            provider_id: provider_id.to_string(),
            ..Default::default()
        });
        claim
    }

    fn node(name: &str, provider_id: &str) -> Node {
        Node {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn kube_with(claims: Vec<NodeClaim>, nodes: Vec<Node>) -> MockKubeStore {
        let mut kube = MockKubeStore::new();
        kube.expect_list_node_claims().returning(move || Ok(claims.clone()));
        kube.expect_list_nodes().returning(move || Ok(nodes.clone()));
        kube
    }

    #[tokio::test]
    async fn test_old_orphan_is_collected() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_list().returning(|| {
            Ok(vec![
                instance("vsphere://orphan-old", 10),
                instance("vsphere://orphan-new", 1),
                instance("vsphere://owned", 60),
            ])
        });
        cloud.expect_delete()
            .withf(|claim| claim.provider_id() == "vsphere://orphan-old")
            .times(1)
            .returning(|_| Ok(()));

        let mut kube = kube_with(
            vec![instance("vsphere://owned", 60)],
            vec![node("node-a", "vsphere://orphan-old"), node("node-b", "vsphere://owned")],
        );
        kube.expect_delete_node()
            .withf(|name| name == "node-a")
            .times(1)
            .returning(|_| Ok(()));

        let gc = GarbageCollector::new(Arc::new(kube), Arc::new(cloud));
        assert_eq!(gc.reconcile().await.unwrap(), FAST_REQUEUE);
    }

    #[tokio::test]
    async fn test_already_deleted_instance_is_success() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_list().returning(|| Ok(vec![instance("vsphere://gone", 10)]));
        cloud.expect_delete()
            .times(1)
            .returning(|_| Err(OperatorError::InstanceNotFound("gone".to_string())));

        let kube = kube_with(vec![], vec![node("node-a", "vsphere://gone")]);
        let gc = GarbageCollector::new(Arc::new(kube), Arc::new(cloud));
        gc.reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminating_instance_is_skipped() {
        let mut terminating = instance("vsphere://stopped", 10);
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let mut cloud = MockCloudProvider::new();
        cloud.expect_list().returning(move || Ok(vec![terminating.clone()]));

        let gc = GarbageCollector::new(Arc::new(kube_with(vec![], vec![])), Arc::new(cloud));
        gc.reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_failure_fails_the_pass() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_list().returning(|| Ok(vec![instance("vsphere://orphan", 10)]));
        cloud.expect_delete()
            .returning(|_| Err(OperatorError::Platform("task failed".to_string())));

        let gc = GarbageCollector::new(Arc::new(kube_with(vec![], vec![])), Arc::new(cloud));
        assert!(gc.reconcile().await.is_err());
        assert_eq!(gc.successful.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_node_delete_failure_does_not_fail_the_pass() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_list().returning(|| Ok(vec![instance("vsphere://orphan", 10)]));
        cloud.expect_delete().times(1).returning(|_| Ok(()));

        let mut kube = kube_with(vec![], vec![node("node-a", "vsphere://orphan")]);
        kube.expect_delete_node()
            .withf(|name| name == "node-a")
            .times(1)
            .returning(|_| Err(OperatorError::Platform("apiserver unavailable".to_string())));

        let gc = GarbageCollector::new(Arc::new(kube), Arc::new(cloud));
        assert_eq!(gc.reconcile().await.unwrap(), FAST_REQUEUE);
        assert_eq!(gc.successful.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_requeue_slows_after_startup() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_list().returning(|| Ok(vec![]));
        let gc = GarbageCollector::new(Arc::new(kube_with(vec![], vec![])), Arc::new(cloud));
        for _ in 0..FAST_PASSES {
            assert_eq!(gc.reconcile().await.unwrap(), FAST_REQUEUE);
        }
        assert_eq!(gc.reconcile().await.unwrap(), SLOW_REQUEUE);
    }
}
