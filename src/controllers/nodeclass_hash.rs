//! Node class hash controller
//!
//! Keeps the content hash annotation on each `VsphereNodeClass` current.
//! When the hashing scheme version changes, dependent node claims are
//! migrated first so that the version bump alone never reads as drift.

use super::{controller_config, error_policy_backoff};
use crate::crd::labels::{
    ANNOTATION_NODECLASS_HASH, ANNOTATION_NODECLASS_HASH_VERSION, NODECLASS_HASH_VERSION,
};
use crate::crd::VsphereNodeClass;
use crate::error::{OperatorError, Result};
use crate::kube_store::KubeStore;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct NodeClassHashController {
    kube: Arc<dyn KubeStore>,
}

impl NodeClassHashController {
    pub fn new(kube: Arc<dyn KubeStore>) -> Self {
        Self { kube }
    }

    pub async fn run(self: Arc<Self>, client: Client) -> Result<()> {
        let classes: Api<VsphereNodeClass> = Api::all(client);

        info!("Starting nodeclass.hash controller");

        Controller::new(classes, Config::default())
            .with_config(controller_config())
            .shutdown_on_signal()
            .run(
                |class, ctx| async move { ctx.reconcile(&class).await },
                |_class, error, _ctx| error_policy_backoff(error),
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!(nodeclass = %obj.name, "Reconciled nodeclass hash"),
                    Err(e) => error!("nodeclass.hash reconciliation failed: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    pub(crate) async fn reconcile(&self, class: &VsphereNodeClass) -> std::result::Result<Action, OperatorError> {
        let hash = class.hash();
        let annotations = class.annotations();
        let version_current =
            annotations.get(ANNOTATION_NODECLASS_HASH_VERSION).map(String::as_str) == Some(NODECLASS_HASH_VERSION);

        if !version_current {
            self.update_node_claim_hashes(class, &hash).await?;
        }

        if !version_current || annotations.get(ANNOTATION_NODECLASS_HASH) != Some(&hash) {
            let patch = json!({
                "metadata": {
                    "annotations": {
                        ANNOTATION_NODECLASS_HASH: hash,
                        ANNOTATION_NODECLASS_HASH_VERSION: NODECLASS_HASH_VERSION,
                    }
                }
            });
            self.kube.patch_node_class(&class.name_any(), patch).await?;
            info!(nodeclass = %class.name_any(), hash = %hash, "Updated nodeclass hash");
        }
        Ok(Action::await_change())
    }

    /// Moves claims of `class` to the current hash version. Claims that are
    /// already drifted keep their old hash so the drift stays visible.
    async fn update_node_claim_hashes(&self, class: &VsphereNodeClass, hash: &str) -> Result<()> {
        let name = class.name_any();
        let claims = self.kube.list_node_claims().await?;
        let mut first_error = None;
        for claim in claims.iter().filter(|c| c.node_class_name() == Some(name.as_str())) {
            let claim_version = claim.annotations().get(ANNOTATION_NODECLASS_HASH_VERSION);
            if claim_version.map(String::as_str) == Some(NODECLASS_HASH_VERSION) {
                continue;
            }
            let mut annotations = serde_json::Map::new();
            annotations.insert(ANNOTATION_NODECLASS_HASH_VERSION.to_string(), json!(NODECLASS_HASH_VERSION));
            if !claim.is_drifted() {
                annotations.insert(ANNOTATION_NODECLASS_HASH.to_string(), json!(hash));
            }
            let patch = json!({ "metadata": { "annotations": annotations } });
            match self.kube.patch_node_claim(&claim.name_any(), patch).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(nodeclaim = %claim.name_any(), error = %e, "Failed to update nodeclaim hash");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{CONDITION_DRIFTED, CONDITION_TRUE};
    use crate::crd::{Condition, NodeClaim, NodeClaimStatus, NodeClassReference};
    use crate::kube_store::MockKubeStore;
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn claim(name: &str, class: &str, drifted: bool) -> NodeClaim {
        let mut claim = NodeClaim::new(name, Default::default());
        claim.spec.node_class_ref = Some(NodeClassReference {
            name: class.to_string(),
            ..Default::default()
        });
        if drifted {
            claim.status = Some(NodeClaimStatus {
                conditions: vec![Condition {
                    r#type: CONDITION_DRIFTED.to_string(),
                    status: CONDITION_TRUE.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            });
        }
        claim
    }

    fn annotation<'a>(patch: &'a Value, key: &str) -> Option<&'a str> {
        patch["metadata"]["annotations"].get(key).and_then(Value::as_str)
    }

    #[tokio::test]
    async fn test_version_bump_migrates_claims() {
        let class = VsphereNodeClass::new("default", Default::default());
        let hash = class.hash();

        let mut kube = MockKubeStore::new();
        kube.expect_list_node_claims().times(1).returning(|| {
            Ok(vec![
                claim("fresh", "default", false),
                claim("drifted", "default", true),
                claim("other", "other-class", false),
            ])
        });
        let expected = hash.clone();
        kube.expect_patch_node_claim()
            .withf(move |name, patch| {
                name == "fresh"
                    && annotation(patch, ANNOTATION_NODECLASS_HASH) == Some(expected.as_str())
                    && annotation(patch, ANNOTATION_NODECLASS_HASH_VERSION) == Some("v1")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_node_claim()
            .withf(|name, patch| {
                name == "drifted"
                    && annotation(patch, ANNOTATION_NODECLASS_HASH).is_none()
                    && annotation(patch, ANNOTATION_NODECLASS_HASH_VERSION) == Some("v1")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let expected = hash.clone();
        kube.expect_patch_node_class()
            .withf(move |name, patch| {
                name == "default" && annotation(patch, ANNOTATION_NODECLASS_HASH) == Some(expected.as_str())
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let controller = NodeClassHashController::new(Arc::new(kube));
        let action = controller.reconcile(&class).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_current_hash_is_not_patched() {
        let mut class = VsphereNodeClass::new("default", Default::default());
        class.metadata.annotations = Some(BTreeMap::from([
            (ANNOTATION_NODECLASS_HASH.to_string(), class.hash()),
            (ANNOTATION_NODECLASS_HASH_VERSION.to_string(), NODECLASS_HASH_VERSION.to_string()),
        ]));
        let controller = NodeClassHashController::new(Arc::new(MockKubeStore::new()));
        controller.reconcile(&class).await.unwrap();
    }

    #[tokio::test]
    async fn test_spec_change_updates_class_only() {
        let mut class = VsphereNodeClass::new("default", Default::default());
        class.metadata.annotations = Some(BTreeMap::from([
            (ANNOTATION_NODECLASS_HASH.to_string(), "stale".to_string()),
            (ANNOTATION_NODECLASS_HASH_VERSION.to_string(), NODECLASS_HASH_VERSION.to_string()),
        ]));
        let mut kube = MockKubeStore::new();
        kube.expect_patch_node_class().times(1).returning(|_, _| Ok(()));
        let controller = NodeClassHashController::new(Arc::new(kube));
        controller.reconcile(&class).await.unwrap();
    }
}
