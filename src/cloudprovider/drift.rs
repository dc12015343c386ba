use crate::crd::labels::{ANNOTATION_NODECLASS_HASH, ANNOTATION_NODECLASS_HASH_VERSION};
use crate::crd::{NodeClaim, VsphereNodeClass};
use kube::ResourceExt;

/// Drift reason reported when a claim no longer matches its node class
pub const NODECLASS_DRIFT: &str = "NodeClassDrift";

/// Compares the hash annotations of the class and the claim.
///
/// Drift needs all four annotations, equal hash versions and differing
/// hashes. A version mismatch means the hashing scheme changed and is
/// not drift.
pub fn static_fields_drifted(claim: &NodeClaim, class: &VsphereNodeClass) -> Option<&'static str> {
    let class_annotations = class.annotations();
    let claim_annotations = claim.annotations();
    let (Some(class_hash), Some(class_version), Some(claim_hash), Some(claim_version)) = (
        class_annotations.get(ANNOTATION_NODECLASS_HASH),
        class_annotations.get(ANNOTATION_NODECLASS_HASH_VERSION),
        claim_annotations.get(ANNOTATION_NODECLASS_HASH),
        claim_annotations.get(ANNOTATION_NODECLASS_HASH_VERSION),
    ) else {
        return None;
    };
    if class_version != claim_version {
        return None;
    }
    (class_hash != claim_hash).then_some(NODECLASS_DRIFT)
}
