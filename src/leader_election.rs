//! Kubernetes Lease-based leader election for HA operator deployments.
//!
//! Only the replica holding the Lease engages clusters and runs the
//! controllers. Standby replicas block in [`LeaderElector::acquire`] until the
//! holder stops renewing and the lease expires.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LEASE_NAME: &str = "workload-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Detects the namespace for leader election.
///
/// Priority: explicit argument, then the service account file, then `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// What a candidate should do with the lease it just read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold it; refresh the renew time
    Renew,
    /// Expired or unheld; claim it
    TakeOver,
    /// Someone else holds a live lease
    Wait,
}

pub fn lease_decision(
    spec: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
) -> LeaseDecision {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseDecision::Renew;
    }
    if holder.is_none() || is_expired(spec, now) {
        return LeaseDecision::TakeOver;
    }
    LeaseDecision::Wait
}

fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = i64::from(
        spec.and_then(|s| s.lease_duration_seconds)
            .unwrap_or(LEASE_DURATION_SECS),
    );

    match renew_time {
        Some(MicroTime(t)) => now.signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

/// Lease spec after `identity` claims or renews it
pub fn claimed_spec(
    previous: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
    takeover: bool,
) -> LeaseSpec {
    let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION_SECS),
        acquire_time: if takeover {
            Some(MicroTime(now))
        } else {
            previous.and_then(|s| s.acquire_time.clone())
        },
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
        ..Default::default()
    }
}

/// Lease-based leader election.
///
/// Uses a `coordination.k8s.io/v1` Lease with optimistic concurrency (via
/// `resourceVersion`) so at most one replica runs the controllers.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("workload-operator-{:08x}", rand::random::<u32>()));
        info!(
            identity = %identity,
            namespace = %namespace,
            lease = %lease_name,
            "Initialized leader elector"
        );
        Self {
            lease_api,
            lease_name: lease_name.to_string(),
            identity,
        }
    }

    /// Blocks until the lease is successfully acquired.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        info!(identity = %self.identity, "Waiting to acquire leader lease '{}'", self.lease_name);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Lease held by another instance, retrying in {:?}", RETRY_INTERVAL);
                }
                Err(e) => {
                    warn!("Lease acquisition error: {}, retrying in {:?}", e, RETRY_INTERVAL);
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease. Returns `Ok(true)` if still leader, `Ok(false)` if lost.
    pub async fn renew(&self) -> anyhow::Result<bool> {
        let lease = self.lease_api.get(&self.lease_name).await?;
        if lease_decision(lease.spec.as_ref(), &self.identity, Utc::now()) != LeaseDecision::Renew {
            return Ok(false);
        }
        let renewed = self.write_lease(&lease, false).await?;
        if renewed {
            debug!("Renewed leader lease");
        } else {
            warn!("Lease conflict during renewal, lost leadership");
        }
        Ok(renewed)
    }

    /// Releases the lease by clearing the holder identity.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let lease = match self.lease_api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut updated = lease.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    /// Returns the recommended interval between lease renewals.
    pub fn renew_interval(&self) -> Duration {
        RENEW_INTERVAL
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        match self.lease_api.get_opt(&self.lease_name).await? {
            Some(existing) => {
                match lease_decision(existing.spec.as_ref(), &self.identity, Utc::now()) {
                    LeaseDecision::Renew => self.write_lease(&existing, false).await,
                    LeaseDecision::TakeOver => self.write_lease(&existing, true).await,
                    LeaseDecision::Wait => Ok(false),
                }
            }
            None => self.create_lease().await,
        }
    }

    async fn create_lease(&self) -> anyhow::Result<bool> {
        let mut spec = claimed_spec(None, &self.identity, Utc::now(), true);
        spec.lease_transitions = Some(0);
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(spec),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the lease with ourselves as holder. A conflict means another
    /// replica won the race.
    async fn write_lease(&self, existing: &Lease, takeover: bool) -> anyhow::Result<bool> {
        let mut updated = existing.clone();
        updated.spec = Some(claimed_spec(
            existing.spec.as_ref(),
            &self.identity,
            Utc::now(),
            takeover,
        ));

        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn spec(holder: Option<&str>, renewed_secs_ago: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            renew_time: Some(MicroTime(Utc::now() - ChronoDuration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn test_lease_decision() {
        let now = Utc::now();
        assert_eq!(lease_decision(Some(&spec(Some("me"), 1)), "me", now), LeaseDecision::Renew);
        assert_eq!(lease_decision(Some(&spec(Some("other"), 1)), "me", now), LeaseDecision::Wait);
        assert_eq!(
            lease_decision(Some(&spec(Some("other"), 60)), "me", now),
            LeaseDecision::TakeOver
        );
        assert_eq!(lease_decision(Some(&spec(None, 1)), "me", now), LeaseDecision::TakeOver);
        assert_eq!(lease_decision(None, "me", now), LeaseDecision::TakeOver);
    }

    #[test]
    fn test_claimed_spec_counts_transitions() {
        let now = Utc::now();
        let mut previous = spec(Some("other"), 60);
        previous.lease_transitions = Some(2);
        previous.acquire_time = Some(MicroTime(now - ChronoDuration::seconds(600)));

        let taken = claimed_spec(Some(&previous), "me", now, true);
        assert_eq!(taken.holder_identity.as_deref(), Some("me"));
        assert_eq!(taken.lease_transitions, Some(3));
        assert_eq!(taken.acquire_time, Some(MicroTime(now)));

        let renewed = claimed_spec(Some(&previous), "me", now, false);
        assert_eq!(renewed.lease_transitions, Some(2));
        assert_eq!(renewed.acquire_time, previous.acquire_time);
        assert_eq!(renewed.renew_time, Some(MicroTime(now)));
    }

    #[test]
    fn test_detect_namespace_explicit() {
        assert_eq!(detect_namespace("operators"), "operators");
    }
}
