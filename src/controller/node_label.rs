//! Node readiness labels driven by loader pods
//!
//! A node carries `<namespace>.<module>.ready` while the module's loader pod
//! on it is Ready. This reconciler is the only writer of that key. Loader
//! pods hold a finalizer so that, on deletion, the label is removed before the
//! pod is allowed to go away:
//!
//! 1. [`CleanupPhase::Unlabel`] clears the node label
//! 2. [`CleanupPhase::ReleaseFinalizer`] removes the finalizer from the pod
//!
//! A failure in the first phase leaves the finalizer in place so the next
//! trigger retries from the start.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::Context;
use crate::metrics;
use crate::patch::{label_patch, remove_finalizer_patch};
use crate::{Error, MODULE_NAME_LABEL, NODE_LABELER_FINALIZER};

const CONTROLLER: &str = "node_label";

/// What the pod says about its node's readiness label
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodState {
    /// Pod is Ready; the node gets the label
    Ready,
    /// Pod is not Ready; the node loses the label
    NotReady,
    /// Pod is being deleted and still holds the finalizer
    Terminating,
}

/// Steps of releasing a terminating loader pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupPhase {
    /// Clear the node label
    Unlabel,
    /// Remove the finalizer from the pod
    ReleaseFinalizer,
    /// Nothing left to do
    Done,
}

impl CleanupPhase {
    /// Phase that follows a successful `self`
    pub fn next(self) -> Self {
        match self {
            Self::Unlabel => Self::ReleaseFinalizer,
            Self::ReleaseFinalizer | Self::Done => Self::Done,
        }
    }
}

/// Classify a pod for labeling
pub fn pod_state(pod: &Pod) -> PodState {
    let deleting = pod.metadata.deletion_timestamp.is_some();
    let has_finalizer = pod.finalizers().iter().any(|f| f == NODE_LABELER_FINALIZER);

    if deleting && has_finalizer {
        PodState::Terminating
    } else if is_ready(pod) {
        PodState::Ready
    } else {
        PodState::NotReady
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Reconcile the node label controlled by a loader pod
#[instrument(
    skip(pod, ctx),
    fields(pod = %pod.name_any(), namespace = %pod.namespace().unwrap_or_default())
)]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    let result = reconcile_pod(&pod.name_any(), &pod.namespace().unwrap_or_default(), &ctx).await;
    metrics::record_reconcile(CONTROLLER, start.elapsed().as_secs_f64(), result.is_ok());
    result
}

/// Requeue a pod after a failed reconcile
pub fn error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        pod = %pod.name_any(),
        namespace = %pod.namespace().unwrap_or_default(),
        "node label reconciliation failed"
    );
    metrics::record_reconcile_error(CONTROLLER);
    Action::requeue(ctx.error_requeue)
}

async fn reconcile_pod(name: &str, namespace: &str, ctx: &Context) -> Result<Action, Error> {
    // A vanished pod is reported, not ignored
    let pod = ctx
        .kube
        .get_pod(name, namespace)
        .await?
        .ok_or_else(|| Error::not_found("Pod", namespace, name))?;

    let module_name = pod.labels().get(MODULE_NAME_LABEL).ok_or_else(|| {
        Error::validation(format!(
            "pod {namespace}/{name} has no {MODULE_NAME_LABEL} label"
        ))
    })?;
    let label_key = ctx.workloads.node_label_from_pod(&pod, module_name);

    match pod_state(&pod) {
        PodState::Ready => set_node_label(ctx, &pod, &label_key, Some(name)).await?,
        PodState::NotReady => set_node_label(ctx, &pod, &label_key, None).await?,
        PodState::Terminating => {
            let mut phase = CleanupPhase::Unlabel;
            while phase != CleanupPhase::Done {
                match phase {
                    CleanupPhase::Unlabel => set_node_label(ctx, &pod, &label_key, None).await?,
                    CleanupPhase::ReleaseFinalizer => release_finalizer(ctx, &pod).await?,
                    CleanupPhase::Done => {}
                }
                phase = phase.next();
            }
        }
    }

    Ok(Action::await_change())
}

async fn set_node_label(
    ctx: &Context,
    pod: &Pod,
    key: &str,
    value: Option<&str>,
) -> Result<(), Error> {
    let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
        debug!("pod not bound to a node yet");
        return Ok(());
    };

    let node = ctx
        .kube
        .get_node(node_name)
        .await?
        .ok_or_else(|| Error::not_found("Node", "", node_name))?;

    match label_patch(node.labels(), key, value) {
        Some(patch) => {
            ctx.kube.patch_node(node_name, &patch).await?;
            info!(node = %node_name, label = %key, set = value.is_some(), "patched node label");
        }
        None => debug!(node = %node_name, label = %key, "node label up to date"),
    }
    Ok(())
}

async fn release_finalizer(ctx: &Context, pod: &Pod) -> Result<(), Error> {
    if let Some(patch) = remove_finalizer_patch(pod.finalizers(), NODE_LABELER_FINALIZER) {
        let namespace = pod.namespace().unwrap_or_default();
        ctx.kube
            .patch_pod(&pod.name_any(), &namespace, &patch)
            .await?;
        info!("released node-labeler finalizer");
    }
    Ok(())
}
