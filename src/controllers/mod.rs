//! Controllers for the vSphere provider
//!
//! The node class controllers each watch `VsphereNodeClass` and own one
//! concern: the content hash, the status, and the termination finalizer.
//! The garbage collector is not bound to any object and schedules itself.

mod garbage_collection;
mod nodeclass_hash;
mod nodeclass_status;
mod nodeclass_termination;

pub use garbage_collection::GarbageCollector;
pub use nodeclass_hash::NodeClassHashController;
pub use nodeclass_status::NodeClassStatusController;
pub use nodeclass_termination::NodeClassTerminationController;

use crate::crd::labels::TERMINATION_FINALIZER;
use crate::crd::VsphereNodeClass;
use crate::error::OperatorError;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use std::time::Duration;
use tracing::{debug, error};

/// In-flight reconciles per node class controller
pub const MAX_CONCURRENT_RECONCILES: u16 = 10;

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

pub(crate) fn controller_config() -> ControllerConfig {
    ControllerConfig::default().concurrency(MAX_CONCURRENT_RECONCILES)
}

/// Requeue delay after a failed reconcile. Conflicts retry almost
/// immediately against the fresh object.
pub(crate) fn error_policy_backoff(error: &OperatorError) -> Action {
    if error.is_conflict() {
        debug!(error = %error, "Conflict, requeueing");
        return Action::requeue(CONFLICT_REQUEUE);
    }
    error!(error = %error, "Reconciliation error");
    Action::requeue(ERROR_REQUEUE)
}

pub(crate) fn has_termination_finalizer(class: &VsphereNodeClass) -> bool {
    class
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == TERMINATION_FINALIZER))
}
