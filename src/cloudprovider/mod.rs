//! The cloud provider contract consumed by the upstream scheduler.
//!
//! Node claims are translated into instances and back. Nothing here keeps
//! state between calls: every claim returned is rebuilt from the platform
//! and the node class it was launched from.

mod drift;

pub use drift::{static_fields_drifted, NODECLASS_DRIFT};

use crate::crd::labels::{LABEL_TOPOLOGY_ZONE, NODEPOOL_LABEL_KEY, PROVIDER_ID_SCHEME};
use crate::crd::{NodeClaim, NodeClaimStatus, NodePool, ResourceList, VsphereNodeClass};
use crate::error::{OperatorError, Result};
use crate::kube_store::KubeStore;
use crate::providers::{Instance, InstanceProvider};
use crate::scheduling::{catalog, filter, quantity, InstanceType, SchedulingConfig};
use crate::vsphere::PowerState;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

pub const PROVIDER_NAME: &str = "vsphere";

pub const NODECLASS_READINESS_UNKNOWN_REASON: &str = "NodeClassReadinessUnknown";
pub const INSTANCE_TYPE_RESOLUTION_FAILED_REASON: &str = "InstanceTypeResolutionFailed";
pub const CREATE_INSTANCE_FAILED_REASON: &str = "CreateInstanceFailed";

/// A node condition the scheduler tolerates for a while before replacing
/// the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPolicy {
    pub condition_type: String,
    pub condition_status: String,
    pub toleration_duration: Duration,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Launches an instance for the claim and returns the resolved claim
    async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim>;

    /// Deletes the claim's instance; an already deleted instance is
    /// [`OperatorError::InstanceNotFound`]
    async fn delete(&self, claim: &NodeClaim) -> Result<()>;

    async fn get(&self, provider_id: &str) -> Result<NodeClaim>;

    /// Every instance of this cluster, including ones no claim owns
    async fn list(&self) -> Result<Vec<NodeClaim>>;

    async fn get_instance_types(&self, pool: &NodePool) -> Result<Vec<InstanceType>>;

    /// The drift reason, if any
    async fn is_drifted(&self, claim: &NodeClaim) -> Result<Option<String>>;

    fn repair_policies(&self) -> Vec<RepairPolicy>;

    fn name(&self) -> &'static str;

    fn supported_node_classes(&self) -> Vec<String>;
}

/// Strips the `vsphere://` scheme from a provider ID
pub fn parse_instance_id(provider_id: &str) -> Result<String> {
    provider_id
        .strip_prefix(PROVIDER_ID_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| OperatorError::InvalidProviderId(provider_id.to_string()))
}

pub fn provider_id(instance_id: &str) -> String {
    format!("{}://{}", PROVIDER_ID_SCHEME, instance_id)
}

pub struct VsphereCloudProvider {
    kube: Arc<dyn KubeStore>,
    instances: Arc<dyn InstanceProvider>,
    scheduling: SchedulingConfig,
    cluster_name: String,
    zone: Option<String>,
}

impl VsphereCloudProvider {
    pub fn new(
        kube: Arc<dyn KubeStore>,
        instances: Arc<dyn InstanceProvider>,
        scheduling: SchedulingConfig,
        cluster_name: &str,
        zone: Option<String>,
    ) -> Self {
        Self {
            kube,
            instances,
            scheduling,
            cluster_name: cluster_name.to_string(),
            zone,
        }
    }

    /// Terminating node classes read as not found
    async fn resolve_node_class(&self, name: &str) -> Result<VsphereNodeClass> {
        let class = self.kube.get_node_class(name).await?;
        if class.is_terminating() {
            return Err(OperatorError::NotFound(format!(
                "vspherenodeclasses.karpenter.vsphere.com {:?} is terminating, treating as not found",
                name
            )));
        }
        Ok(class)
    }

    async fn resolve_node_class_from_claim(&self, claim: &NodeClaim) -> Result<VsphereNodeClass> {
        let name = claim.node_class_name().ok_or_else(|| {
            OperatorError::NotFound(format!("nodeclaim {} has no nodeClassRef", claim.name_any()))
        })?;
        self.resolve_node_class(name).await
    }

    async fn resolve_node_class_from_pool(&self, pool: &NodePool) -> Result<VsphereNodeClass> {
        let name = pool
            .spec
            .template
            .spec
            .node_class_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .ok_or_else(|| {
                OperatorError::NotFound(format!("nodepool {} has no nodeClassRef", pool.name_any()))
            })?;
        self.resolve_node_class(name).await
    }

    /// The instance type an instance was launched as, found through the
    /// node pool and class named by its tags
    async fn resolve_instance_type(&self, instance: &Instance) -> Result<InstanceType> {
        if instance.node_pool.is_empty() {
            return Err(OperatorError::NotFound(format!(
                "instance {} is missing the nodepool tag",
                instance.name
            )));
        }
        let pool = self.kube.get_node_pool(&instance.node_pool).await?;
        self.get_instance_types(&pool)
            .await?
            .into_iter()
            .find(|it| it.name == instance.instance_type)
            .ok_or_else(|| {
                OperatorError::NotFound(format!(
                    "instance type {} not found in offerings",
                    instance.instance_type
                ))
            })
    }

    async fn instance_to_claim_resolved(&self, instance: Instance) -> NodeClaim {
        match self.resolve_instance_type(&instance).await {
            Ok(instance_type) => self.instance_to_claim(instance, Some(&instance_type)),
            Err(e) => {
                debug!(instance = %instance.name, error = %e, "Could not resolve instance type");
                self.instance_to_claim(instance, None)
            }
        }
    }

    fn instance_to_claim(&self, instance: Instance, instance_type: Option<&InstanceType>) -> NodeClaim {
        let prefix = format!("{}-karp-", self.cluster_name);
        let name = instance
            .name
            .strip_prefix(&prefix)
            .unwrap_or(&instance.name)
            .to_string();
        let mut claim = NodeClaim::new(&name, Default::default());
        let mut status = NodeClaimStatus {
            provider_id: provider_id(&instance.id),
            image_id: instance.image.clone(),
            ..Default::default()
        };

        let mut labels = instance_type
            .map(|it| it.requirements.single_valued_labels())
            .unwrap_or_default();
        if let Some(it) = instance_type {
            status.capacity = non_zero(&it.capacity);
            status.allocatable = non_zero(it.allocatable());
        }
        if !instance.zone.is_empty() {
            labels.insert(LABEL_TOPOLOGY_ZONE.to_string(), instance.zone.clone());
        }
        if !instance.node_pool.is_empty() {
            labels.insert(NODEPOOL_LABEL_KEY.to_string(), instance.node_pool.clone());
        }

        claim.metadata.labels = Some(labels);
        claim.metadata.creation_timestamp = instance.created_at.map(Time);
        if instance.power_state == PowerState::PoweredOff {
            claim.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        claim.status = Some(status);
        claim
    }
}

fn non_zero(resources: &ResourceList) -> ResourceList {
    resources
        .iter()
        .filter(|(_, q)| !quantity::is_zero(q))
        .map(|(k, q)| (k.clone(), q.clone()))
        .collect()
}

#[async_trait]
impl CloudProvider for VsphereCloudProvider {
    async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim> {
        let class = self
            .resolve_node_class_from_claim(claim)
            .await
            .map_err(|e| OperatorError::InsufficientCapacity(format!("resolving node class, {}", e)))?;

        match class.ready_condition() {
            Some(ready) if ready.status == crate::conditions::CONDITION_TRUE => {}
            Some(ready) if ready.status == crate::conditions::CONDITION_FALSE => {
                return Err(OperatorError::NodeClassNotReady(
                    ready.message.clone().unwrap_or_default(),
                ));
            }
            ready => {
                let message = ready.and_then(|c| c.message.clone()).unwrap_or_default();
                return Err(OperatorError::create(
                    NODECLASS_READINESS_UNKNOWN_REASON,
                    format!(
                        "resolving NodeClass readiness, NodeClass is in Ready=Unknown, {}",
                        message
                    ),
                ));
            }
        }
        class.get_kubernetes_version()?;

        let instance_types = filter(claim, catalog(&class, self.zone.as_deref()), &self.scheduling)
            .map_err(|e| {
                OperatorError::create(
                    INSTANCE_TYPE_RESOLUTION_FAILED_REASON,
                    format!("resolving instance types, {}", e),
                )
            })?;
        let Some(instance_type) = instance_types.first() else {
            return Err(OperatorError::InsufficientCapacity(
                "all requested instance types were unavailable during launch".to_string(),
            ));
        };

        let instance = self
            .instances
            .create(&class, claim, &instance_types)
            .await
            .map_err(|e| match e {
                OperatorError::InsufficientCapacity(_) => e,
                other => OperatorError::create(
                    CREATE_INSTANCE_FAILED_REASON,
                    format!("creating instance failed, {}", other),
                ),
            })?;
        info!(
            nodeclaim = %claim.name_any(),
            provider_id = %provider_id(&instance.id),
            instance_type = %instance_type.name,
            "Launched instance"
        );
        Ok(self.instance_to_claim(instance, Some(instance_type)))
    }

    async fn delete(&self, claim: &NodeClaim) -> Result<()> {
        let id = parse_instance_id(claim.provider_id())?;
        self.instances.delete(&id).await
    }

    async fn get(&self, provider_id: &str) -> Result<NodeClaim> {
        let id = parse_instance_id(provider_id)?;
        let instance = self.instances.get(&id).await?;
        Ok(self.instance_to_claim_resolved(instance).await)
    }

    async fn list(&self) -> Result<Vec<NodeClaim>> {
        let instances = self.instances.list().await?;
        let mut claims = Vec::with_capacity(instances.len());
        for instance in instances {
            claims.push(self.instance_to_claim_resolved(instance).await);
        }
        debug!(count = claims.len(), "Listed instances");
        Ok(claims)
    }

    async fn get_instance_types(&self, pool: &NodePool) -> Result<Vec<InstanceType>> {
        let class = self.resolve_node_class_from_pool(pool).await?;
        Ok(catalog(&class, self.zone.as_deref()))
    }

    async fn is_drifted(&self, claim: &NodeClaim) -> Result<Option<String>> {
        let Some(pool_name) = claim.labels().get(NODEPOOL_LABEL_KEY) else {
            return Ok(None);
        };
        let pool = match self.kube.get_node_pool(pool_name).await {
            Ok(pool) => pool,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if pool.spec.template.spec.node_class_ref.is_none() {
            return Ok(None);
        }
        let class = match self.resolve_node_class_from_pool(&pool).await {
            Ok(class) => class,
            Err(e) if e.is_not_found() => return Ok(Some(NODECLASS_DRIFT.to_string())),
            Err(e) => return Err(e),
        };
        let reason = static_fields_drifted(claim, &class);
        if let Some(reason) = reason {
            warn!(nodeclaim = %claim.name_any(), reason, "NodeClaim is drifted");
        }
        Ok(reason.map(str::to_string))
    }

    fn repair_policies(&self) -> Vec<RepairPolicy> {
        vec![RepairPolicy {
            condition_type: "Ready".to_string(),
            condition_status: "False".to_string(),
            toleration_duration: Duration::from_secs(30 * 60),
        }]
    }

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn supported_node_classes(&self) -> Vec<String> {
        vec![VsphereNodeClass::kind(&()).to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{
        build_condition, CONDITION_FALSE, CONDITION_READY, CONDITION_TRUE, CONDITION_UNKNOWN,
        KUBERNETES_VERSION_READY,
    };
    use crate::crd::labels::{
        ANNOTATION_NODECLASS_HASH, ANNOTATION_NODECLASS_HASH_VERSION, LABEL_ARCH,
        LABEL_INSTANCE_TYPE,
    };
    use crate::crd::{
        NodeClaimSpec, NodeClassReference, NodeSelectorRequirementWithMinValues,
        VsphereNodeClassStatus,
    };
    use crate::kube_store::MockKubeStore;
    use crate::providers::instance::tests::{inventory, node_class, node_claim, provider};
    use crate::vsphere::fake::FakeVsphere;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn with_status(mut class: VsphereNodeClass, ready: &str) -> VsphereNodeClass {
        class.metadata.generation = Some(1);
        class.status = Some(VsphereNodeClassStatus {
            kubernetes_version: "1.31.4".to_string(),
            conditions: vec![
                build_condition(KUBERNETES_VERSION_READY, CONDITION_TRUE, "Discovered", "", Some(1)),
                build_condition(CONDITION_READY, ready, "Ready", "version unknown", Some(1)),
            ],
        });
        class
    }

    fn claim_for_class(name: &str) -> NodeClaim {
        let mut claim = node_claim(name);
        claim.spec = NodeClaimSpec {
            node_class_ref: Some(NodeClassReference {
                group: "karpenter.vsphere.com".to_string(),
                kind: "VsphereNodeClass".to_string(),
                name: "default".to_string(),
            }),
            requirements: vec![NodeSelectorRequirementWithMinValues {
                key: LABEL_ARCH.to_string(),
                operator: "In".to_string(),
                values: vec!["amd64".to_string()],
                min_values: None,
            }],
            ..Default::default()
        };
        claim.spec.resources.requests = BTreeMap::from([("cpu".to_string(), Quantity("1".to_string()))]);
        claim
    }

    fn pool(class_ref: bool) -> NodePool {
        let mut pool = NodePool::new("default", Default::default());
        if class_ref {
            pool.spec.template.spec.node_class_ref = Some(NodeClassReference {
                name: "default".to_string(),
                ..Default::default()
            });
        }
        pool
    }

    fn cloud_provider(kube: MockKubeStore, fake: Arc<FakeVsphere>) -> VsphereCloudProvider {
        VsphereCloudProvider::new(
            Arc::new(kube),
            Arc::new(provider(fake)),
            SchedulingConfig::default(),
            "demo",
            Some("east".to_string()),
        )
    }

    fn kube_with_class(class: VsphereNodeClass) -> MockKubeStore {
        let mut kube = MockKubeStore::new();
        kube.expect_get_node_class()
            .returning(move |_| Ok(class.clone()));
        kube.expect_get_node_pool().returning(|_| Ok(pool(true)));
        kube
    }

    #[test]
    fn test_parse_instance_id() {
        assert_eq!(parse_instance_id("vsphere://4217-abcd").unwrap(), "4217-abcd");
        for bad in ["", "vsphere://", "aws:///i-123", "4217-abcd"] {
            assert!(matches!(
                parse_instance_id(bad),
                Err(OperatorError::InvalidProviderId(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_create_maps_instance_to_claim() {
        let fake = inventory();
        let cp = cloud_provider(kube_with_class(with_status(node_class(), CONDITION_TRUE)), fake.clone());

        let created = cp.create(&claim_for_class("default-abcde")).await.unwrap();
        assert_eq!(created.name_any(), "default-abcde");
        let labels = created.labels();
        assert_eq!(labels[LABEL_INSTANCE_TYPE], "small");
        assert_eq!(labels[LABEL_ARCH], "amd64");
        assert_eq!(labels[LABEL_TOPOLOGY_ZONE], "east");
        assert_eq!(labels[NODEPOOL_LABEL_KEY], "default");
        let status = created.status.unwrap();
        assert!(status.provider_id.starts_with("vsphere://uuid-"));
        assert_eq!(status.image_id, "ubuntu-22.04");
        assert_eq!(status.capacity["cpu"].0, "1500m");
        assert_eq!(status.allocatable["memory"].0, "4Gi");
        assert!(created.metadata.deletion_timestamp.is_none());
    }

    #[tokio::test]
    async fn test_create_requires_ready_class() {
        let fake = inventory();
        let cp = cloud_provider(kube_with_class(with_status(node_class(), CONDITION_FALSE)), fake.clone());
        let err = cp.create(&claim_for_class("c1")).await.unwrap_err();
        assert!(matches!(err, OperatorError::NodeClassNotReady(_)));

        let cp = cloud_provider(kube_with_class(with_status(node_class(), CONDITION_UNKNOWN)), fake.clone());
        match cp.create(&claim_for_class("c1")).await.unwrap_err() {
            OperatorError::Create { reason, .. } => assert_eq!(reason, NODECLASS_READINESS_UNKNOWN_REASON),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(fake.clones().is_empty());
    }

    #[tokio::test]
    async fn test_create_with_terminating_class() {
        let mut class = with_status(node_class(), CONDITION_TRUE);
        class.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let cp = cloud_provider(kube_with_class(class), inventory());
        let err = cp.create(&claim_for_class("c1")).await.unwrap_err();
        assert!(err.is_insufficient_capacity());
        assert!(err.to_string().contains("is terminating, treating as not found"));
    }

    #[tokio::test]
    async fn test_create_without_compatible_types() {
        let fake = inventory();
        let cp = cloud_provider(kube_with_class(with_status(node_class(), CONDITION_TRUE)), fake.clone());
        let mut claim = claim_for_class("c1");
        claim.spec.requirements[0].values = vec!["arm64".to_string()];
        assert!(cp.create(&claim).await.unwrap_err().is_insufficient_capacity());

        let mut claim = claim_for_class("c1");
        claim.spec.resources.requests = BTreeMap::from([("cpu".to_string(), Quantity("16".to_string()))]);
        assert!(cp.create(&claim).await.unwrap_err().is_insufficient_capacity());
        assert!(fake.clones().is_empty());
    }

    #[tokio::test]
    async fn test_create_with_stale_version_fails() {
        let mut class = with_status(node_class(), CONDITION_TRUE);
        class.metadata.generation = Some(2);
        let cp = cloud_provider(kube_with_class(class), inventory());
        let err = cp.create(&claim_for_class("c1")).await.unwrap_err();
        assert!(matches!(err, OperatorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_list_get_and_delete() {
        let fake = inventory();
        let cp = cloud_provider(kube_with_class(with_status(node_class(), CONDITION_TRUE)), fake.clone());
        let created = cp.create(&claim_for_class("c1")).await.unwrap();

        let orphan = fake.add_vm("/dc1/vm/karpenter/demo-karp-orphan", Default::default());
        fake.set_power_state(&orphan, PowerState::PoweredOff);

        let listed = cp.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        let launched = listed.iter().find(|c| c.name_any() == "c1").unwrap();
        assert_eq!(launched.provider_id(), created.provider_id());
        assert_eq!(launched.labels()[LABEL_INSTANCE_TYPE], "small");
        let orphan_claim = listed.iter().find(|c| c.name_any() == "orphan").unwrap();
        assert!(orphan_claim.metadata.deletion_timestamp.is_some());
        assert!(orphan_claim.status.as_ref().unwrap().capacity.is_empty());

        let got = cp.get(created.provider_id()).await.unwrap();
        assert_eq!(got.provider_id(), created.provider_id());

        cp.delete(&created).await.unwrap();
        assert!(cp.delete(&created).await.unwrap_err().is_instance_not_found());
        assert!(matches!(
            cp.delete(&NodeClaim::new("nameless", Default::default())).await,
            Err(OperatorError::InvalidProviderId(_))
        ));
    }

    fn annotated_claim(hash: &str) -> NodeClaim {
        let mut claim = node_claim("c1");
        claim.metadata.annotations = Some(BTreeMap::from([
            (ANNOTATION_NODECLASS_HASH.to_string(), hash.to_string()),
            (ANNOTATION_NODECLASS_HASH_VERSION.to_string(), "v1".to_string()),
        ]));
        claim
    }

    fn annotated_class(hash: &str) -> VsphereNodeClass {
        let mut class = node_class();
        class.metadata.annotations = Some(BTreeMap::from([
            (ANNOTATION_NODECLASS_HASH.to_string(), hash.to_string()),
            (ANNOTATION_NODECLASS_HASH_VERSION.to_string(), "v1".to_string()),
        ]));
        class
    }

    #[tokio::test]
    async fn test_is_drifted() {
        let cp = cloud_provider(kube_with_class(annotated_class("1")), inventory());
        assert_eq!(
            cp.is_drifted(&annotated_claim("2")).await.unwrap().as_deref(),
            Some(NODECLASS_DRIFT)
        );
        assert_eq!(cp.is_drifted(&annotated_claim("1")).await.unwrap(), None);
        assert_eq!(
            cp.is_drifted(&NodeClaim::new("unpooled", Default::default())).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_is_drifted_without_pool_or_class() {
        let mut kube = MockKubeStore::new();
        kube.expect_get_node_pool()
            .returning(|_| Err(OperatorError::NotFound("nodepool".to_string())));
        let cp = cloud_provider(kube, inventory());
        assert_eq!(cp.is_drifted(&annotated_claim("2")).await.unwrap(), None);

        let mut kube = MockKubeStore::new();
        kube.expect_get_node_pool().returning(|_| Ok(pool(false)));
        let cp = cloud_provider(kube, inventory());
        assert_eq!(cp.is_drifted(&annotated_claim("2")).await.unwrap(), None);

        let mut kube = MockKubeStore::new();
        kube.expect_get_node_pool().returning(|_| Ok(pool(true)));
        kube.expect_get_node_class()
            .returning(|_| Err(OperatorError::NotFound("nodeclass".to_string())));
        let cp = cloud_provider(kube, inventory());
        assert_eq!(
            cp.is_drifted(&annotated_claim("2")).await.unwrap().as_deref(),
            Some(NODECLASS_DRIFT)
        );
    }

    #[test]
    fn test_static_capabilities() {
        let cp = cloud_provider(MockKubeStore::new(), Arc::new(FakeVsphere::new()));
        assert_eq!(cp.name(), "vsphere");
        assert_eq!(cp.supported_node_classes(), vec!["VsphereNodeClass".to_string()]);
        let policies = cp.repair_policies();
        assert_eq!(policies[0].toleration_duration, Duration::from_secs(1800));
    }
}
