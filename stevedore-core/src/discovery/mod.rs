//! Builder pod discovery.
//!
//! Locates and exclusively claims a build-engine endpoint inside a dynamic,
//! multi-replica cluster: a pod watcher feeds ready candidates to per-pod
//! leader-election attempts, the first attempt to win delivers its pod into a
//! single-winner slot, every other attempt is cancelled, and the claimed
//! endpoint is returned together with an ordered cleanup chain.

mod lease;
mod watch;

pub use lease::{holder_identity, lease_name, LeaseLock, LEASE_DURATION, RENEW_DEADLINE, RETRY_PERIOD};

use crate::engine::EngineClient;
use crate::error::{Result, StevedoreError};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label marking the claimed pod with the app it is building for.
pub const APP_NAME_LABEL_KEY: &str = "stevedore.io/app-name";

/// Label marking the claimed pod as running a build.
pub const IS_BUILD_LABEL_KEY: &str = "stevedore.io/is-build";

/// Namespace holding the platform's App custom resources.
const PLATFORM_NAMESPACE: &str = "stevedore";

/// API group of the platform's custom resources.
const PLATFORM_GROUP: &str = "stevedore.io";

/// How builder pods are discovered and claimed.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Fixed namespace to search; `None` derives it from the app resource.
    pub namespace: Option<String>,
    /// Label selector matching builder pods.
    pub pod_selector: String,
    /// Build engine port on the claimed pod.
    pub port: u16,
    /// Prefix of the per-pod lease names.
    pub lease_prefix: String,
    /// Tag the claimed pod with app ownership labels.
    pub set_app_label: bool,
}

/// A ready builder pod observed during discovery. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePod {
    pub name: String,
    pub namespace: String,
    pub ip: String,
}

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CleanupStep = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// A stack of labelled release actions, run in reverse order of acquisition.
///
/// Running the chain drains it, so running it again is a no-op; teardown
/// paths may call it without tracking whether someone already did.
#[derive(Default)]
pub struct CleanupChain {
    steps: Vec<(&'static str, CleanupStep)>,
}

impl CleanupChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a release action. Call right after the matching acquisition.
    pub fn push<F, Fut>(&mut self, label: &'static str, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.steps.push((label, Box::new(move || Box::pin(step()))));
    }

    /// Runs all pending release actions, most recent first.
    pub async fn run(&mut self) {
        while let Some((label, step)) = self.steps.pop() {
            debug!(step = label, "running discovery cleanup step");
            step().await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A claimed build engine: the connected client plus the release actions that
/// undo the claim.
pub struct ClaimedBuilder {
    pub engine: EngineClient,
    cleanup: CleanupChain,
}

impl ClaimedBuilder {
    /// Releases the claim: closes the connection, removes ownership labels,
    /// cancels the winning lease. Safe to call more than once.
    pub async fn release(&mut self) {
        self.cleanup.run().await;
    }
}

/// Discovers and claims exactly one builder pod.
pub struct PodDiscoverer {
    client: kube::Client,
}

impl PodDiscoverer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Runs the discovery race and returns a connected, exclusively-claimed
    /// build engine. Any failure after partial acquisition still runs the
    /// release actions built so far.
    pub async fn discover(
        &self,
        opts: &DiscoveryOptions,
        app: Option<&str>,
    ) -> Result<ClaimedBuilder> {
        let namespace = self.resolve_namespace(opts, app).await?;

        let root = CancellationToken::new();
        let mut cleanup = CleanupChain::new();
        let election = root.clone();
        cleanup.push("cancel-leader-election", move || async move {
            election.cancel();
        });

        match self.claim(opts, app, &namespace, &root, &mut cleanup).await {
            Ok(engine) => Ok(ClaimedBuilder { engine, cleanup }),
            Err(err) => {
                cleanup.run().await;
                Err(err)
            }
        }
    }

    async fn claim(
        &self,
        opts: &DiscoveryOptions,
        app: Option<&str>,
        namespace: &str,
        root: &CancellationToken,
        cleanup: &mut CleanupChain,
    ) -> Result<EngineClient> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let (pod_tx, pod_rx) = mpsc::channel(1);
        tokio::spawn(watch::watch_ready_pods(
            pods.clone(),
            opts.pod_selector.clone(),
            pod_tx,
            root.child_token(),
        ));

        let (win_tx, win_rx) = mpsc::channel(1);
        let identity = holder_identity();
        let lease_prefix = opts.lease_prefix.clone();
        let client = self.client.clone();

        let spawn_attempt = move |candidate: CandidatePod, token: CancellationToken| {
            let lock = LeaseLock::new(
                client.clone(),
                &candidate.namespace,
                lease_name(&lease_prefix, &candidate.name),
                identity.clone(),
            );
            let win_tx = win_tx.clone();
            tokio::spawn(async move {
                lock.run(token, move || {
                    // The slot holds one winner; a filled slot means another
                    // attempt already won and this delivery is abandoned.
                    match win_tx.try_send(candidate.clone()) {
                        Ok(()) => {
                            info!(pod = %candidate.name, "selected builder pod");
                        }
                        Err(_) => {
                            debug!(pod = %candidate.name, "builder already selected elsewhere");
                        }
                    }
                })
                .await;
            });
        };

        let (winner, attempts) = race_candidates(pod_rx, win_rx, spawn_attempt, root).await?;
        cancel_losers(&attempts, &winner.name);

        if opts.set_app_label {
            if let Some(app) = app {
                debug!(pod = %winner.name, app, "labelling builder pod with app ownership");
                set_ownership_labels(&pods, &winner.name, app).await?;

                let unlabel_api = pods.clone();
                let pod_name = winner.name.clone();
                cleanup.push("remove-ownership-labels", move || async move {
                    // Best-effort, and deliberately not bound to the caller's
                    // cancellation: the claim is being torn down either way.
                    if let Err(err) = remove_ownership_labels(&unlabel_api, &pod_name).await {
                        warn!(pod = %pod_name, error = %err, "failed to remove ownership labels");
                    }
                });
            }
        }

        let addr = format!("http://{}:{}", winner.ip, opts.port);
        info!(addr, pod = %winner.name, "connecting to build engine");
        let engine = EngineClient::connect(&addr).await?;

        cleanup.push("close-engine-connection", move || async move {
            // The transport shuts down once the last clone drops; this step
            // pins the close to its place in the release order.
            debug!(addr, "closing build engine connection");
        });

        Ok(engine)
    }

    async fn resolve_namespace(
        &self,
        opts: &DiscoveryOptions,
        app: Option<&str>,
    ) -> Result<String> {
        if let Some(namespace) = &opts.namespace {
            return Ok(namespace.clone());
        }

        let app = app.ok_or(StevedoreError::DiscoveryUnscoped)?;
        debug!(app, "resolving builder namespace from the app resource");

        let gvk = GroupVersionKind::gvk(PLATFORM_GROUP, "v1", "App");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "apps");
        let apps: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), PLATFORM_NAMESPACE, &resource);

        let object = apps.get(app).await.map_err(|e| StevedoreError::NamespaceLookup {
            app: app.to_string(),
            reason: e.to_string(),
        })?;

        object
            .data
            .pointer("/spec/namespaceName")
            .and_then(|value| value.as_str())
            .map(String::from)
            .ok_or_else(|| StevedoreError::NamespaceLookup {
                app: app.to_string(),
                reason: "namespaceName not set on the App resource".to_string(),
            })
    }
}

/// The single-consumer race loop: starts one attempt per distinct pod name
/// (duplicate events never double-race a pod) and blocks until one attempt
/// delivers a winner. The attempt map is owned by this loop alone.
async fn race_candidates<F>(
    mut pods: mpsc::Receiver<Result<CandidatePod>>,
    mut winner: mpsc::Receiver<CandidatePod>,
    mut spawn_attempt: F,
    parent: &CancellationToken,
) -> Result<(CandidatePod, BTreeMap<String, CancellationToken>)>
where
    F: FnMut(CandidatePod, CancellationToken),
{
    let mut attempts: BTreeMap<String, CancellationToken> = BTreeMap::new();
    let mut watching = true;

    loop {
        tokio::select! {
            _ = parent.cancelled() => return Err(StevedoreError::Cancelled),

            delivered = winner.recv() => {
                let winner = delivered.ok_or_else(|| {
                    StevedoreError::Internal("winner slot closed before a delivery".to_string())
                })?;
                return Ok((winner, attempts));
            }

            event = pods.recv(), if watching => match event {
                Some(Ok(candidate)) => {
                    if attempts.contains_key(&candidate.name) {
                        continue;
                    }
                    let token = parent.child_token();
                    attempts.insert(candidate.name.clone(), token.clone());
                    debug!(pod = %candidate.name, "starting lease attempt");
                    spawn_attempt(candidate, token);
                }
                Some(Err(err)) => return Err(err),
                // Watch ended cleanly; outstanding attempts keep racing.
                None => watching = false,
            },
        }
    }
}

/// Cancels every attempt except the winner's, in name order so release logs
/// are deterministic.
fn cancel_losers(attempts: &BTreeMap<String, CancellationToken>, winner: &str) {
    for (name, token) in attempts {
        if name == winner {
            continue;
        }
        debug!(pod = %name, "releasing lease attempt for losing pod");
        token.cancel();
    }
}

async fn set_ownership_labels(pods: &Api<Pod>, pod_name: &str, app: &str) -> Result<()> {
    let patch = json!([
        {
            "op": "replace",
            "path": format!("/metadata/labels/{}", escape_json_pointer(APP_NAME_LABEL_KEY)),
            "value": app,
        },
        {
            "op": "replace",
            "path": format!("/metadata/labels/{}", escape_json_pointer(IS_BUILD_LABEL_KEY)),
            "value": "true",
        },
    ]);
    let patch: json_patch::Patch =
        serde_json::from_value(patch).map_err(|e| StevedoreError::Internal(e.to_string()))?;

    pods.patch(pod_name, &PatchParams::default(), &Patch::Json::<()>(patch)).await?;
    Ok(())
}

async fn remove_ownership_labels(pods: &Api<Pod>, pod_name: &str) -> Result<()> {
    let patch = json!([
        {
            "op": "remove",
            "path": format!("/metadata/labels/{}", escape_json_pointer(APP_NAME_LABEL_KEY)),
        },
        {
            "op": "remove",
            "path": format!("/metadata/labels/{}", escape_json_pointer(IS_BUILD_LABEL_KEY)),
        },
    ]);
    let patch: json_patch::Patch =
        serde_json::from_value(patch).map_err(|e| StevedoreError::Internal(e.to_string()))?;

    pods.patch(pod_name, &PatchParams::default(), &Patch::Json::<()>(patch)).await?;
    Ok(())
}

/// Escapes a label key for use in a JSON-Pointer path: `~` becomes `~0`,
/// `/` becomes `~1` (RFC 6902).
fn escape_json_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
