//! Node class termination controller
//!
//! Holds the termination finalizer on a deleted `VsphereNodeClass` until no
//! node claim references it any more. Claim deletions requeue the owning
//! class so the finalizer goes away as soon as the last claim is gone.

use super::{controller_config, error_policy_backoff, has_termination_finalizer};
use crate::crd::labels::TERMINATION_FINALIZER;
use crate::crd::{NodeClaim, VsphereNodeClass};
use crate::error::{OperatorError, Result};
use crate::events::{actions, reasons, EventPublisher};
use crate::kube_store::KubeStore;
use futures::{future, StreamExt, TryStreamExt};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Requeue while dependent claims are still terminating
pub const WAITING_REQUEUE: Duration = Duration::from_secs(10 * 60);

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Claim names listed in the waiting event
const MAX_LISTED_CLAIMS: usize = 5;

pub struct NodeClassTerminationController {
    kube: Arc<dyn KubeStore>,
    events: Arc<dyn EventPublisher>,
}

impl NodeClassTerminationController {
    pub fn new(kube: Arc<dyn KubeStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    pub async fn run(self: Arc<Self>, client: Client) -> Result<()> {
        let classes: Api<VsphereNodeClass> = Api::all(client.clone());
        let claims: Api<NodeClaim> = Api::all(client);

        // Only deletions can unblock a finalizer
        let deleted_claims = watcher::watcher(claims, Config::default()).try_filter_map(|event| {
            future::ready(Ok(match event {
                watcher::Event::Delete(claim) => Some(claim),
                _ => None,
            }))
        });

        info!("Starting nodeclass.termination controller");

        Controller::new(classes, Config::default())
            .with_config(controller_config())
            .watches_stream(deleted_claims, |claim: NodeClaim| {
                claim.node_class_name().map(ObjectRef::<VsphereNodeClass>::new)
            })
            .shutdown_on_signal()
            .run(
                |class, ctx| async move { ctx.reconcile(&class).await },
                |_class, error, _ctx| error_policy_backoff(error),
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!(nodeclass = %obj.name, "Reconciled nodeclass termination"),
                    Err(e) => error!("nodeclass.termination reconciliation failed: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    pub(crate) async fn reconcile(&self, class: &VsphereNodeClass) -> std::result::Result<Action, OperatorError> {
        if !class.is_terminating() || !has_termination_finalizer(class) {
            return Ok(Action::await_change());
        }
        let name = class.name_any();

        let remaining: Vec<String> = self
            .kube
            .list_node_claims()
            .await?
            .iter()
            .filter(|c| c.node_class_name() == Some(name.as_str()))
            .map(ResourceExt::name_any)
            .collect();
        if !remaining.is_empty() {
            debug!(nodeclass = %name, claims = remaining.len(), "Waiting on nodeclaim termination");
            self.events
                .publish(
                    &class.object_ref(&()),
                    EventType::Normal,
                    reasons::WAITING_ON_NODECLAIM_TERMINATION,
                    actions::FINALIZE,
                    Some(format!(
                        "Waiting on NodeClaim termination for {}",
                        pretty_list(&remaining, MAX_LISTED_CLAIMS)
                    )),
                )
                .await;
            return Ok(Action::requeue(WAITING_REQUEUE));
        }

        let finalizers: Vec<&String> = class
            .finalizers()
            .iter()
            .filter(|f| *f != TERMINATION_FINALIZER)
            .collect();
        let patch = json!({
            "metadata": {
                "resourceVersion": class.resource_version(),
                "finalizers": finalizers
            }
        });
        match self.kube.patch_node_class(&name, patch).await {
            Ok(()) => {
                info!(nodeclass = %name, "Removed termination finalizer");
                Ok(Action::await_change())
            }
            Err(e) if e.is_conflict() => Ok(Action::requeue(CONFLICT_REQUEUE)),
            Err(e) if e.is_not_found() => Ok(Action::await_change()),
            Err(e) => Err(e),
        }
    }
}

/// Joins at most `max` items, summarizing the rest as `and N other(s)`.
pub fn pretty_list<T: Display>(items: &[T], max: usize) -> String {
    let mut out = items
        .iter()
        .take(max)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > max {
        out.push_str(&format!(" and {} other(s)", items.len() - max));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeClassReference;
    use crate::events::MockEventPublisher;
    use crate::kube_store::MockKubeStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn terminating_class() -> VsphereNodeClass {
        let mut class = VsphereNodeClass::new("default", Default::default());
        class.metadata.uid = Some("5c1f".to_string());
        class.metadata.resource_version = Some("7".to_string());
        class.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        class.metadata.finalizers = Some(vec![
            "example.com/other".to_string(),
            TERMINATION_FINALIZER.to_string(),
        ]);
        class
    }

    fn claim(name: &str) -> NodeClaim {
        let mut claim = NodeClaim::new(name, Default::default());
        claim.spec.node_class_ref = Some(NodeClassReference {
            name: "default".to_string(),
            ..Default::default()
        });
        claim
    }

    #[test]
    fn test_pretty_list() {
        let names: Vec<String> = (1..=7).map(|i| format!("c{}", i)).collect();
        assert_eq!(pretty_list(&names[..1], 5), "c1");
        assert_eq!(pretty_list(&names[..5], 5), "c1, c2, c3, c4, c5");
        assert_eq!(pretty_list(&names, 5), "c1, c2, c3, c4, c5 and 2 other(s)");
        assert_eq!(pretty_list::<String>(&[], 5), "");
    }

    #[tokio::test]
    async fn test_waits_on_remaining_claims() {
        let class = terminating_class();
        let mut kube = MockKubeStore::new();
        kube.expect_list_node_claims()
            .times(2)
            .returning(|| Ok(vec![claim("default-abc")]));
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|obj, type_, reason, _action, note| {
                obj.uid.as_deref() == Some("5c1f")
                    && *type_ == EventType::Normal
                    && reason == reasons::WAITING_ON_NODECLAIM_TERMINATION
                    && note.as_deref() == Some("Waiting on NodeClaim termination for default-abc")
            })
            .times(2)
            .returning(|_, _, _, _, _| ());

        let controller = NodeClassTerminationController::new(Arc::new(kube), Arc::new(events));
        for _ in 0..2 {
            let action = controller.reconcile(&class).await.unwrap();
            assert_eq!(action, Action::requeue(WAITING_REQUEUE));
        }
    }

    #[tokio::test]
    async fn test_removes_finalizer_once_claims_are_gone() {
        let class = terminating_class();
        let mut kube = MockKubeStore::new();
        kube.expect_list_node_claims().times(1).returning(|| Ok(vec![]));
        kube.expect_patch_node_class()
            .withf(|name, patch| {
                name == "default"
                    && patch["metadata"]["resourceVersion"] == "7"
                    && patch["metadata"]["finalizers"] == json!(["example.com/other"])
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let controller =
            NodeClassTerminationController::new(Arc::new(kube), Arc::new(MockEventPublisher::new()));
        assert_eq!(controller.reconcile(&class).await.unwrap(), Action::await_change());
    }

    #[tokio::test]
    async fn test_conflict_requeues() {
        let class = terminating_class();
        let mut kube = MockKubeStore::new();
        kube.expect_list_node_claims().returning(|| Ok(vec![]));
        kube.expect_patch_node_class()
            .returning(|_, _| Err(OperatorError::Conflict("stale resourceVersion".to_string())));

        let controller =
            NodeClassTerminationController::new(Arc::new(kube), Arc::new(MockEventPublisher::new()));
        assert_eq!(controller.reconcile(&class).await.unwrap(), Action::requeue(CONFLICT_REQUEUE));
    }

    #[tokio::test]
    async fn test_live_class_is_ignored() {
        let mut class = terminating_class();
        class.metadata.deletion_timestamp = None;
        let controller = NodeClassTerminationController::new(
            Arc::new(MockKubeStore::new()),
            Arc::new(MockEventPublisher::new()),
        );
        assert_eq!(controller.reconcile(&class).await.unwrap(), Action::await_change());
    }
}
