//! Kubernetes Event recording for the provider's controllers.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// How long an identical event is suppressed
pub const DEDUPE_TIMEOUT: Duration = Duration::from_secs(120);

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Suppresses repeats of the same reason on the same object for
/// [`DEDUPE_TIMEOUT`], regardless of the note.
pub struct DedupingEventPublisher {
    inner: Arc<dyn EventPublisher>,
    seen: Cache<String, ()>,
}

impl DedupingEventPublisher {
    pub fn new(inner: Arc<dyn EventPublisher>) -> Self {
        Self::with_timeout(inner, DEDUPE_TIMEOUT)
    }

    pub fn with_timeout(inner: Arc<dyn EventPublisher>, timeout: Duration) -> Self {
        Self {
            inner,
            seen: Cache::builder().time_to_live(timeout).build(),
        }
    }
}

#[async_trait]
impl EventPublisher for DedupingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let key = format!(
            "{}/{}",
            reason,
            resource_ref
                .uid
                .as_deref()
                .or(resource_ref.name.as_deref())
                .unwrap_or_default()
        );
        if self.seen.contains_key(&key) {
            return;
        }
        self.seen.insert(key, ()).await;
        self.inner
            .publish(resource_ref, type_, reason, action, note)
            .await;
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Node class deletion is blocked on dependent node claims
    pub const WAITING_ON_NODECLAIM_TERMINATION: &str = "WaitingOnNodeClaimTermination";
}

/// Well-known event action strings.
pub mod actions {
    pub const FINALIZE: &str = "Finalize";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_ref(uid: &str) -> ObjectReference {
        ObjectReference {
            kind: Some("VsphereNodeClass".to_string()),
            name: Some("default".to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_repeated_event_is_published_once() {
        let mut inner = MockEventPublisher::new();
        inner.expect_publish().times(1).return_const(());
        let publisher = DedupingEventPublisher::new(Arc::new(inner));

        for note in ["first", "second"] {
            publisher
                .publish(
                    &object_ref("uid-1"),
                    EventType::Normal,
                    reasons::WAITING_ON_NODECLAIM_TERMINATION,
                    actions::FINALIZE,
                    Some(note.to_string()),
                )
                .await;
        }
    }

    #[tokio::test]
    async fn test_distinct_objects_are_not_deduplicated() {
        let mut inner = MockEventPublisher::new();
        inner.expect_publish().times(2).return_const(());
        let publisher = DedupingEventPublisher::new(Arc::new(inner));

        for uid in ["uid-1", "uid-2"] {
            publisher
                .publish(
                    &object_ref(uid),
                    EventType::Normal,
                    reasons::WAITING_ON_NODECLAIM_TERMINATION,
                    actions::FINALIZE,
                    None,
                )
                .await;
        }
    }
}
