//! Builder pod watching.
//!
//! Streams pod lifecycle events for a label selector and emits pods once
//! they become ready. Delete events are ignored: a departed pod simply stops
//! producing events, and its lease attempt is torn down by the discoverer's
//! own lifecycle.

use crate::discovery::CandidatePod;
use crate::error::{Result, StevedoreError};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, WatchEvent, WatchParams};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Watches `pods` matching `selector` and sends every ready pod into `tx`.
///
/// One invocation, one watch: a watch-stream error is sent in-band and ends
/// the sequence. Retrying is the caller's decision, not this layer's.
/// Cancelling `cancel` stops the underlying event stream.
pub(crate) async fn watch_ready_pods(
    pods: Api<Pod>,
    selector: String,
    tx: mpsc::Sender<Result<CandidatePod>>,
    cancel: CancellationToken,
) {
    if let Err(fatal) = run_watch(pods, &selector, &tx, &cancel).await {
        let _ = tx.send(Err(fatal)).await;
    }
}

async fn run_watch(
    pods: Api<Pod>,
    selector: &str,
    tx: &mpsc::Sender<Result<CandidatePod>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let params = WatchParams::default().labels(selector);
    let mut stream = pods.watch(&params, "0").await.map_err(StevedoreError::Watch)?.boxed();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = stream.try_next() => event.map_err(StevedoreError::Watch)?,
        };

        match event {
            Some(WatchEvent::Added(pod)) | Some(WatchEvent::Modified(pod)) => {
                match ready_candidate(&pod) {
                    Some(candidate) => {
                        if tx.send(Ok(candidate)).await.is_err() {
                            // Discovery is done with candidates.
                            return Ok(());
                        }
                    }
                    None => {
                        debug!(
                            pod = pod.metadata.name.as_deref().unwrap_or_default(),
                            "builder pod is not ready yet"
                        );
                    }
                }
            }
            Some(WatchEvent::Deleted(_)) | Some(WatchEvent::Bookmark(_)) => {}
            Some(WatchEvent::Error(status)) => {
                return Err(StevedoreError::Watch(kube::Error::Api(status)));
            }
            // Server closed the watch; the candidate sequence ends here.
            None => return Ok(()),
        }
    }
}

/// A pod is a candidate once it is running, has an IP, and reports Ready.
fn ready_candidate(pod: &Pod) -> Option<CandidatePod> {
    if !is_pod_ready(pod) {
        return None;
    }
    Some(CandidatePod {
        name: pod.metadata.name.clone()?,
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        ip: pod.status.as_ref()?.pod_ip.clone()?,
    })
}

pub(crate) fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else { return false };

    let running = status.phase.as_deref() == Some("Running");
    let has_ip = status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty());
    let ready = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|condition| condition.type_ == "Ready")
        .fold(false, |_, condition| condition.status == "True");

    running && has_ip && ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(phase: &str, ip: Option<&str>, ready: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("buildkit-0".to_string()),
                namespace: Some("builders".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(String::from),
                conditions: ready.map(|status| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_pod_with_ip_and_ready_condition_is_ready() {
        assert!(is_pod_ready(&pod("Running", Some("10.0.0.5"), Some("True"))));
    }

    #[test]
    fn pending_or_ipless_or_unready_pods_are_not_candidates() {
        assert!(!is_pod_ready(&pod("Pending", Some("10.0.0.5"), Some("True"))));
        assert!(!is_pod_ready(&pod("Running", None, Some("True"))));
        assert!(!is_pod_ready(&pod("Running", Some(""), Some("True"))));
        assert!(!is_pod_ready(&pod("Running", Some("10.0.0.5"), Some("False"))));
        assert!(!is_pod_ready(&pod("Running", Some("10.0.0.5"), None)));
    }

    #[test]
    fn last_ready_condition_wins() {
        let mut candidate = pod("Running", Some("10.0.0.5"), Some("False"));
        candidate.status.as_mut().unwrap().conditions.as_mut().unwrap().push(PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
        assert!(is_pod_ready(&candidate));
    }

    #[test]
    fn ready_candidate_carries_name_namespace_and_ip() {
        let candidate = ready_candidate(&pod("Running", Some("10.0.0.5"), Some("True"))).unwrap();
        assert_eq!(candidate.name, "buildkit-0");
        assert_eq!(candidate.namespace, "builders");
        assert_eq!(candidate.ip, "10.0.0.5");
    }
}
