//! Scheduling primitives shared by the cloud provider and its controllers.

pub mod instance_type;
pub mod quantity;
pub mod requirements;

use crate::crd::labels::{
    BASE_WELL_KNOWN_LABELS, GROUP, LABEL_INSTANCE_CPU, LABEL_INSTANCE_MEMORY, LABEL_INSTANCE_SIZE,
    LABEL_NODECLASS,
};
use std::collections::BTreeSet;

pub use instance_type::{catalog, filter, InstanceType, Offering};
pub use requirements::{Operator, Requirement, Requirements};

/// Label registries handed to the cloud provider at construction.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    pub well_known_labels: BTreeSet<String>,
    /// Label domains claims may not select on directly
    pub restricted_label_domains: BTreeSet<String>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        let well_known_labels = BASE_WELL_KNOWN_LABELS
            .iter()
            .chain([LABEL_INSTANCE_SIZE, LABEL_INSTANCE_CPU, LABEL_INSTANCE_MEMORY, LABEL_NODECLASS].iter())
            .map(|s| s.to_string())
            .collect();
        Self {
            well_known_labels,
            restricted_label_domains: BTreeSet::from([GROUP.to_string()]),
        }
    }
}

impl SchedulingConfig {
    pub fn well_known_labels(&self) -> BTreeSet<String> {
        self.well_known_labels.clone()
    }

    /// A label is restricted when its domain, or any parent domain, is
    /// restricted and it is not itself well known.
    pub fn is_restricted_label(&self, key: &str) -> bool {
        if self.well_known_labels.contains(key) {
            return false;
        }
        let Some((domain, _)) = key.split_once('/') else {
            return false;
        };
        self.restricted_label_domains
            .iter()
            .any(|restricted| domain == restricted || domain.ends_with(&format!(".{}", restricted)))
    }
}
