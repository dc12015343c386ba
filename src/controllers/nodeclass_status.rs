//! Node class status controller
//!
//! Adds the termination finalizer and keeps `status.kubernetesVersion` and
//! the readiness conditions current. The control-plane version rarely
//! changes, so classes are requeued on a fixed interval instead of
//! watching for it.

use super::{controller_config, error_policy_backoff, has_termination_finalizer};
use crate::conditions::{
    build_condition, set_condition, update_ready, CONDITION_FALSE, CONDITION_TRUE,
    KUBERNETES_VERSION_READY, NODECLASS_DEPENDENT_CONDITIONS,
};
use crate::crd::labels::TERMINATION_FINALIZER;
use crate::crd::{VsphereNodeClass, VsphereNodeClassStatus};
use crate::error::{OperatorError, Result};
use crate::kube_store::KubeStore;
use crate::providers::KubernetesVersionSource;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use semver::Version;
use serde_json::json;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const STATUS_REQUEUE: Duration = Duration::from_secs(15 * 60);

pub struct NodeClassStatusController {
    kube: Arc<dyn KubeStore>,
    versions: Arc<dyn KubernetesVersionSource>,
}

impl NodeClassStatusController {
    pub fn new(kube: Arc<dyn KubeStore>, versions: Arc<dyn KubernetesVersionSource>) -> Self {
        Self { kube, versions }
    }

    pub async fn run(self: Arc<Self>, client: Client) -> Result<()> {
        let classes: Api<VsphereNodeClass> = Api::all(client);

        info!("Starting nodeclass.status controller");

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
                    Ok((obj, _action)) => debug!(nodeclass = %obj.name, "Reconciled nodeclass status"),
                    Err(e) => error!("nodeclass.status reconciliation failed: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    pub(crate) async fn reconcile(&self, class: &VsphereNodeClass) -> std::result::Result<Action, OperatorError> {
        if class.is_terminating() {
            return Ok(Action::await_change());
        }
        // The finalizer patch bumps the resource version; the resulting
        // watch event brings the status pass.
        if self.ensure_finalizer(class).await? {
            return Ok(Action::await_change());
        }

        let current = class.status.clone().unwrap_or_default();
        let mut status = current.clone();
        let generation = class.metadata.generation;

        let outcome = self.reconcile_kubernetes_version(class, &mut status).await;
        update_ready(&mut status.conditions, NODECLASS_DEPENDENT_CONDITIONS, generation);

        if status != current {
            self.patch_status(class, &status).await?;
        }
        outcome?;

        Ok(Action::requeue(STATUS_REQUEUE))
    }

    /// Returns true when the finalizer had to be added
    async fn ensure_finalizer(&self, class: &VsphereNodeClass) -> Result<bool> {
        if has_termination_finalizer(class) {
            return Ok(false);
        }
        let mut finalizers = class.finalizers().to_vec();
        finalizers.push(TERMINATION_FINALIZER.to_string());
        let patch = json!({
            "metadata": {
                "resourceVersion": class.resource_version(),
                "finalizers": finalizers
            }
        });
        self.kube.patch_node_class(&class.name_any(), patch).await?;
        info!(nodeclass = %class.name_any(), "Added termination finalizer");
        Ok(true)
    }

    /// Records the discovered control-plane version. Downgrades are not
    /// supported, so an older version never replaces a newer one.
    async fn reconcile_kubernetes_version(
        &self,
        class: &VsphereNodeClass,
        status: &mut VsphereNodeClassStatus,
    ) -> Result<()> {
        let generation = class.metadata.generation;
        let discovered = match self.versions.get().await {
            Ok(v) => v,
            Err(e) => {
                set_condition(
                    &mut status.conditions,
                    build_condition(
                        KUBERNETES_VERSION_READY,
                        CONDITION_FALSE,
                        "KubernetesVersionDiscoveryFailed",
                        &e.to_string(),
                        generation,
                    ),
                );
                return Err(e);
            }
        };

        if status.kubernetes_version.is_empty() {
            info!(nodeclass = %class.name_any(), version = %discovered, "Discovered kubernetes version");
            status.kubernetes_version = discovered;
        } else if status.kubernetes_version != discovered {
            match compare_versions(&discovered, &status.kubernetes_version)? {
                Ordering::Less => warn!(
                    nodeclass = %class.name_any(),
                    current = %status.kubernetes_version,
                    discovered = %discovered,
                    "Refusing kubernetes version downgrade"
                ),
                _ => {
                    info!(
                        nodeclass = %class.name_any(),
                        from = %status.kubernetes_version,
                        to = %discovered,
                        "Kubernetes version changed"
                    );
                    status.kubernetes_version = discovered;
                }
            }
        }

        set_condition(
            &mut status.conditions,
            build_condition(
                KUBERNETES_VERSION_READY,
                CONDITION_TRUE,
                "KubernetesVersionDiscovered",
                "",
                generation,
            ),
        );
        Ok(())
    }

    async fn patch_status(&self, class: &VsphereNodeClass, status: &VsphereNodeClassStatus) -> Result<()> {
        let patch = json!({
            "metadata": { "resourceVersion": class.resource_version() },
            "status": status
        });
        self.kube.patch_node_class_status(&class.name_any(), patch).await
    }
}

/// Precedence comparison; build metadata such as `+rke2r1` is ignored.
fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    let parse = |v: &str| {
        Version::parse(v).map_err(|e| OperatorError::InvalidState(format!("parsing version {}: {}", v, e)))
    };
    Ok(parse(a)?.cmp_precedence(&parse(b)?))
}
