//! Per-pod leader election over coordination.k8s.io Lease records.
//!
//! Each candidate pod gets one election attempt racing for a lease named
//! after the pod. Acquisition is a create-or-adopt loop with optimistic
//! concurrency: conflicts simply mean another holder got there first and the
//! attempt retries until cancelled. Timings are tuned for sub-5-second
//! acquisition.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a holder owns the lease without renewing.
pub const LEASE_DURATION: Duration = Duration::from_secs(5);

/// Ceiling on a single renewal round-trip before leadership is considered
/// lost.
pub const RENEW_DEADLINE: Duration = Duration::from_secs(2);

/// Pacing of acquisition and renewal attempts.
pub const RETRY_PERIOD: Duration = Duration::from_millis(500);

/// Lease name for a candidate pod.
pub fn lease_name(prefix: &str, pod_name: &str) -> String {
    format!("{}-{}", prefix.trim_end_matches('-'), pod_name)
}

/// Identity under which this process competes for leases: the agent's own
/// pod name when running in-cluster, its hostname otherwise.
pub fn holder_identity() -> String {
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        if !pod_name.is_empty() {
            return pod_name;
        }
    }

    #[cfg(unix)]
    if let Ok(hostname) = nix::unistd::gethostname() {
        return hostname.to_string_lossy().into_owned();
    }

    "stevedore-agent".to_string()
}

/// A named, namespaced lock record raced by one election attempt.
pub struct LeaseLock {
    api: Api<Lease>,
    name: String,
    identity: String,
}

impl LeaseLock {
    pub fn new(client: kube::Client, namespace: &str, name: String, identity: String) -> Self {
        Self { api: Api::namespaced(client, namespace), name, identity }
    }

    /// Runs the election until `cancel` fires. `on_leading` is invoked each
    /// time leadership is won; losing an acquired lease re-enters the
    /// acquisition loop rather than ending the attempt.
    pub async fn run<F: FnMut()>(self, cancel: CancellationToken, mut on_leading: F) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.acquire_loop() => {}
            }

            debug!(lease = %self.name, identity = %self.identity, "acquired builder lease");
            on_leading();

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.release().await;
                    return;
                }
                _ = self.hold_loop() => {
                    debug!(lease = %self.name, "lost builder lease, re-entering election");
                }
            }
        }
    }

    /// Retries acquisition every [`RETRY_PERIOD`] until it succeeds. API
    /// errors are treated as another round of the race, not as fatal: the
    /// attempt's cancellation token is its only exit.
    async fn acquire_loop(&self) {
        loop {
            match self.try_acquire().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    debug!(lease = %self.name, error = %err, "lease acquisition attempt failed")
                }
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    async fn try_acquire(&self) -> kube::Result<bool> {
        let now = MicroTime(Utc::now());

        let Some(existing) = self.api.get_opt(&self.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    ..Default::default()
                },
                spec: Some(self.owned_spec(now, 0)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(err) if is_conflict(&err) => Ok(false),
                Err(err) => Err(err),
            };
        };

        let spec = existing.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        if !held_by_us && !lease_expired(&spec, &now) {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(!held_by_us);
        let updated = Lease {
            metadata: existing.metadata.clone(),
            spec: Some(self.owned_spec(now, transitions)),
        };
        match self.api.replace(&self.name, &PostParams::default(), &updated).await {
            Ok(_) => Ok(true),
            Err(err) if is_conflict(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Renews while leading; returns once leadership is lost.
    async fn hold_loop(&self) {
        loop {
            tokio::time::sleep(RETRY_PERIOD).await;

            match tokio::time::timeout(RENEW_DEADLINE, self.renew()).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return,
                Ok(Err(err)) => {
                    warn!(lease = %self.name, error = %err, "lease renewal failed");
                    return;
                }
                Err(_) => {
                    warn!(lease = %self.name, "lease renewal exceeded the renew deadline");
                    return;
                }
            }
        }
    }

    async fn renew(&self) -> kube::Result<bool> {
        let Some(existing) = self.api.get_opt(&self.name).await? else { return Ok(false) };
        let spec = existing.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let updated = Lease {
            metadata: existing.metadata.clone(),
            spec: Some(LeaseSpec { renew_time: Some(MicroTime(Utc::now())), ..spec }),
        };
        match self.api.replace(&self.name, &PostParams::default(), &updated).await {
            Ok(_) => Ok(true),
            Err(err) if is_conflict(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Best-effort release on cancellation: clears the holder so the next
    /// election does not wait out the full lease duration.
    async fn release(&self) {
        let existing = match self.api.get_opt(&self.name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(err) => {
                warn!(lease = %self.name, error = %err, "failed to read lease for release");
                return;
            }
        };

        let spec = existing.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return;
        }

        let updated = Lease {
            metadata: existing.metadata.clone(),
            spec: Some(LeaseSpec {
                holder_identity: None,
                renew_time: None,
                acquire_time: None,
                ..spec
            }),
        };
        if let Err(err) = self.api.replace(&self.name, &PostParams::default(), &updated).await {
            warn!(lease = %self.name, error = %err, "failed to release lease");
        } else {
            debug!(lease = %self.name, "released builder lease");
        }
    }

    fn owned_spec(&self, now: MicroTime, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}

fn lease_expired(spec: &LeaseSpec, now: &MicroTime) -> bool {
    let Some(renewed) = spec.renew_time.as_ref() else { return true };
    let duration = spec
        .lease_duration_seconds
        .map(|secs| chrono::Duration::seconds(i64::from(secs)))
        .unwrap_or_else(|| chrono::Duration::seconds(LEASE_DURATION.as_secs() as i64));
    renewed.0 + duration < now.0
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_names_are_prefix_dash_pod() {
        assert_eq!(lease_name("buildkit", "buildkit-2"), "buildkit-buildkit-2");
        assert_eq!(lease_name("buildkit-", "pod-a"), "buildkit-pod-a");
    }

    #[test]
    fn missing_renew_time_counts_as_expired() {
        assert!(lease_expired(&LeaseSpec::default(), &MicroTime(Utc::now())));
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        let now = Utc::now();
        let spec = LeaseSpec {
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(5),
            ..Default::default()
        };
        assert!(!lease_expired(&spec, &MicroTime(now)));
    }

    #[test]
    fn stale_lease_is_expired() {
        let now = Utc::now();
        let spec = LeaseSpec {
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(30))),
            lease_duration_seconds: Some(5),
            ..Default::default()
        };
        assert!(lease_expired(&spec, &MicroTime(now)));
    }

    #[test]
    fn holder_identity_prefers_pod_name() {
        // POD_NAME is process-global; only assert the fallback shape here.
        let identity = holder_identity();
        assert!(!identity.is_empty());
    }
}
