//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for the node class conditions
//! following the Kubernetes API conventions. `Ready` is a root condition
//! derived from every dependent condition.

use crate::crd::Condition;
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// VsphereNodeClass condition types
pub const CONDITION_READY: &str = "Ready";
pub const KUBERNETES_VERSION_READY: &str = "KubernetesVersionReady";

/// Conditions that must all be True for the node class to be Ready
pub const NODECLASS_DEPENDENT_CONDITIONS: &[&str] = &[KUBERNETES_VERSION_READY];

// NodeClaim condition types written by the upstream scheduler
pub const CONDITION_DRIFTED: &str = "Drifted";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        observed_generation,
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
    } else {
        conditions.push(new);
    }
}

pub fn is_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.r#type == condition_type && c.status == CONDITION_TRUE)
}

/// Recompute the root Ready condition from the dependent conditions.
///
/// Any False dependent makes Ready False with that dependent's message; a
/// missing or Unknown dependent makes Ready Unknown.
pub fn update_ready(conditions: &mut Vec<Condition>, dependents: &[&str], generation: Option<i64>) {
    let mut status = CONDITION_TRUE;
    let mut reason = "Ready".to_string();
    let mut message = String::new();
    for dependent in dependents {
        match conditions.iter().find(|c| c.r#type == *dependent) {
            Some(c) if c.status == CONDITION_TRUE => {}
            Some(c) if c.status == CONDITION_FALSE => {
                status = CONDITION_FALSE;
                reason = format!("{}False", dependent);
                message = c.message.clone().unwrap_or_default();
                break;
            }
            other => {
                status = CONDITION_UNKNOWN;
                reason = format!("{}Unknown", dependent);
                message = other
                    .and_then(|c| c.message.clone())
                    .unwrap_or_else(|| format!("{} has not been reconciled", dependent));
            }
        }
    }
    set_condition(
        conditions,
        build_condition(CONDITION_READY, status, &reason, &message, generation),
    );
}
