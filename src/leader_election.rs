//! Lease-based leader election.
//!
//! Only one replica may run the controllers: two garbage collectors would
//! race to destroy the same VMs. Standby replicas block in
//! [`LeaderElector::acquire`] until the holder's lease expires.

use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "karpenter-provider-vsphere-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Namespace holding the Lease: the explicit value, else the pod's own
/// namespace, else `default`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// What a replica may do with an observed lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseClaim {
    /// We already hold it
    Renew,
    /// The holder stopped renewing
    TakeOver,
    /// Someone else holds it
    Wait,
}

fn classify(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseClaim {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseClaim::Renew;
    }
    if holder.is_none() {
        return LeaseClaim::TakeOver;
    }
    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(renewed)) if now.signed_duration_since(*renewed).num_seconds() <= duration => {
            LeaseClaim::Wait
        }
        _ => LeaseClaim::TakeOver,
    }
}

pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("karpenter-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, lease = LEASE_NAME, "Initialized leader elector");
        Self {
            lease_api: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Blocks until this replica holds the lease
    pub async fn acquire(&self) -> Result<()> {
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => debug!("Lease held by another replica"),
                Err(e) => warn!(error = %e, "Lease acquisition failed"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Returns `Ok(false)` once leadership is lost
    pub async fn renew(&self) -> Result<bool> {
        let lease = self.lease_api.get(LEASE_NAME).await?;
        if classify(lease.spec.as_ref(), &self.identity, Utc::now()) != LeaseClaim::Renew {
            return Ok(false);
        }
        self.write(&lease, Utc::now(), false).await
    }

    /// Clears the holder so a standby can take over without waiting out the lease
    pub async fn release(&self) {
        let lease = match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        if classify(lease.spec.as_ref(), &self.identity, Utc::now()) != LeaseClaim::Renew {
            return;
        }
        let mut released = lease;
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &released)
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        RENEW_INTERVAL
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        match self.lease_api.get(LEASE_NAME).await {
            Ok(existing) => match classify(existing.spec.as_ref(), &self.identity, now) {
                LeaseClaim::Renew => self.write(&existing, now, false).await,
                LeaseClaim::TakeOver => self.write(&existing, now, true).await,
                LeaseClaim::Wait => Ok(false),
            },
            Err(e) => match OperatorError::from(e) {
                OperatorError::NotFound(_) => self.create(now).await,
                other => Err(other),
            },
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        let created = self.lease_api.create(&PostParams::default(), &lease).await;
        lost_race_is_false(created.map(|_| ()))
    }

    /// Replaces the lease under its resourceVersion; a conflict means
    /// another replica wrote first.
    async fn write(&self, existing: &Lease, now: DateTime<Utc>, takeover: bool) -> Result<bool> {
        let prev = existing.spec.clone().unwrap_or_default();
        let transitions = prev.lease_transitions.unwrap_or(0);
        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if takeover { Some(MicroTime(now)) } else { prev.acquire_time },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        });
        let replaced = self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await;
        lost_race_is_false(replaced.map(|_| ()))
    }
}

/// A write that lost to another replica is `Ok(false)`
fn lost_race_is_false(written: std::result::Result<(), kube::Error>) -> Result<bool> {
    match written.map_err(OperatorError::from) {
        Ok(()) => Ok(true),
        Err(OperatorError::Conflict(_)) => {
            debug!("Lease written by another replica first");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: Option<&str>, renewed_secs_ago: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_lease() {
        let now = Utc::now();
        assert_eq!(classify(Some(&spec(Some("me"), 1)), "me", now), LeaseClaim::Renew);
        assert_eq!(classify(Some(&spec(Some("other"), 1)), "me", now), LeaseClaim::Wait);
        assert_eq!(classify(Some(&spec(Some("other"), 60)), "me", now), LeaseClaim::TakeOver);
        assert_eq!(classify(Some(&spec(None, 1)), "me", now), LeaseClaim::TakeOver);
        assert_eq!(classify(None, "me", now), LeaseClaim::TakeOver);
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "lease".to_string(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_conflicting_write_is_lost_race() {
        assert!(lost_race_is_false(Ok(())).unwrap());
        assert!(!lost_race_is_false(Err(api_error(409))).unwrap());
        assert!(lost_race_is_false(Err(api_error(500))).is_err());
    }

    #[test]
    fn test_detect_namespace_prefers_explicit() {
        assert_eq!(detect_namespace("karpenter"), "karpenter");
    }
}
