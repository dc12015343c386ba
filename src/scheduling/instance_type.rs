//! Instance types offered by a node class, and matching them to claims.

use super::quantity::{self, fits};
use super::requirements::{Operator, Requirement, Requirements};
use super::SchedulingConfig;
use crate::crd::labels::{
    CAPACITY_TYPE_LABEL_KEY, CAPACITY_TYPE_ON_DEMAND, LABEL_ARCH, LABEL_INSTANCE_TYPE, LABEL_OS,
    LABEL_TOPOLOGY_ZONE,
};
use crate::crd::{InstanceTypeDefinition, NodeClaim, ResourceList, VsphereNodeClass};
use crate::error::Result;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::warn;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";

#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub requirements: Requirements,
    pub price: f64,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub name: String,
    pub requirements: Requirements,
    pub capacity: ResourceList,
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// No overhead is reserved, so allocatable equals capacity
    pub fn allocatable(&self) -> &ResourceList {
        &self.capacity
    }

    pub fn cpu(&self) -> Option<&Quantity> {
        self.capacity.get(RESOURCE_CPU)
    }

    pub fn memory(&self) -> Option<&Quantity> {
        self.capacity.get(RESOURCE_MEMORY)
    }

    fn from_definition(def: &InstanceTypeDefinition, zone: Option<&str>) -> Result<Self> {
        let mut capacity = ResourceList::new();
        for (resource, raw) in [
            (RESOURCE_CPU, &def.cpu),
            (RESOURCE_MEMORY, &def.memory),
            (RESOURCE_PODS, &def.max_pods),
            (RESOURCE_EPHEMERAL_STORAGE, &def.storage),
        ] {
            if raw.is_empty() {
                continue;
            }
            // reject garbage early rather than at fit time
            quantity::parse(raw)?;
            capacity.insert(resource.to_string(), Quantity(raw.clone()));
        }

        let requirements = Requirements::new([
            Requirement::new(LABEL_INSTANCE_TYPE, Operator::In, [def.name.as_str()]),
            Requirement::new(LABEL_ARCH, Operator::In, [def.arch.as_str()]),
            Requirement::new(LABEL_OS, Operator::In, [def.os.as_str()]),
        ]);

        let zone_requirement = match zone {
            Some(zone) => Requirement::new(LABEL_TOPOLOGY_ZONE, Operator::In, [zone]),
            None => Requirement::new(LABEL_TOPOLOGY_ZONE, Operator::Exists, Vec::<String>::new()),
        };
        let offering = Offering {
            requirements: Requirements::new([
                zone_requirement,
                Requirement::new(CAPACITY_TYPE_LABEL_KEY, Operator::In, [CAPACITY_TYPE_ON_DEMAND]),
            ]),
            price: 0.0,
            available: true,
        };

        Ok(InstanceType {
            name: def.name.clone(),
            requirements,
            capacity,
            offerings: vec![offering],
        })
    }
}

/// One instance type per declared definition, in declaration order.
/// Definitions with unparseable quantities are skipped.
pub fn catalog(class: &VsphereNodeClass, zone: Option<&str>) -> Vec<InstanceType> {
    class
        .spec
        .instance_types
        .iter()
        .filter_map(|def| match InstanceType::from_definition(def, zone) {
            Ok(it) => Some(it),
            Err(e) => {
                warn!(instance_type = %def.name, error = %e, "Skipping invalid instance type");
                None
            }
        })
        .collect()
}

/// Instance types that can satisfy the claim, preserving catalog order.
pub fn filter(
    claim: &NodeClaim,
    catalog: Vec<InstanceType>,
    config: &SchedulingConfig,
) -> Result<Vec<InstanceType>> {
    let claim_requirements = Requirements::from_node_selector(&claim.spec.requirements)?;
    let allow_undefined = config.well_known_labels();
    let requests = &claim.spec.resources.requests;

    Ok(catalog
        .into_iter()
        .filter(|it| {
            claim_requirements
                .compatible(&it.requirements, &allow_undefined)
                .is_ok()
                && it.offerings.iter().any(|o| {
                    o.available
                        && claim_requirements
                            .compatible(&o.requirements, &allow_undefined)
                            .is_ok()
                })
                && fits(requests, it.allocatable())
        })
        .collect())
}
