//! Node kernel labels
//!
//! Loader DaemonSets select nodes by `kmm.node.kubernetes.io/kernel-version.full`.
//! This reconciler keeps that label equal to the kernel version the node's
//! kubelet reports, so a loader for a kernel lands exactly on the nodes
//! running it. A kernel that is not a valid label value leaves the node
//! unlabeled.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};

use super::module::node_kernel;
use super::Context;
use crate::metrics;
use crate::patch::label_patch;
use crate::{Error, KERNEL_VERSION_LABEL};

const CONTROLLER: &str = "node_kernel";

const MAX_LABEL_VALUE_LEN: usize = 63;

static LABEL_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$")
        .expect("hardcoded label value pattern is valid")
});

/// Returns true if `value` may be stored as a Kubernetes label value
pub fn is_label_value(value: &str) -> bool {
    value.len() <= MAX_LABEL_VALUE_LEN && LABEL_VALUE.is_match(value)
}

/// Kernel label a node should carry, `None` when it should carry none
pub fn desired_kernel_label(node: &Node) -> Option<&str> {
    let kernel = node_kernel(node)?;
    if is_label_value(kernel) {
        Some(kernel)
    } else {
        warn!(node = %node.name_any(), kernel, "kernel version is not a valid label value");
        None
    }
}

/// Reconcile the kernel label of a Node
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    let result = reconcile_node(&node.name_any(), &ctx).await;
    metrics::record_reconcile(CONTROLLER, start.elapsed().as_secs_f64(), result.is_ok());
    result
}

/// Requeue a Node after a failed reconcile
pub fn error_policy(node: Arc<Node>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(?error, node = %node.name_any(), "node kernel labeling failed");
    metrics::record_reconcile_error(CONTROLLER);
    Action::requeue(ctx.error_requeue)
}

async fn reconcile_node(name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(node) = ctx.kube.get_node(name).await? else {
        debug!("node not found, nothing to do");
        return Ok(Action::await_change());
    };

    let kernel = desired_kernel_label(&node);
    match label_patch(node.labels(), KERNEL_VERSION_LABEL, kernel) {
        Some(patch) => {
            ctx.kube.patch_node(name, &patch).await?;
            info!(kernel = kernel.unwrap_or("<none>"), "patched node kernel label");
        }
        None => debug!("node kernel label up to date"),
    }
    Ok(Action::await_change())
}
