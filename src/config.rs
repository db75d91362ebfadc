//! Command line configuration
//!
//! Flags fall back to environment variables so the operator can be
//! configured from its Deployment manifest.

use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::Error;

/// Default requeue delay after a failed reconcile
pub const DEFAULT_ERROR_REQUEUE_SECS: u64 = 30;

/// Default in-cluster build image
pub const DEFAULT_BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";

/// Default in-cluster signing image
pub const DEFAULT_SIGNER_IMAGE: &str =
    "quay.io/edge-infrastructure/kernel-module-management-signimage:latest";

/// KMM - Kubernetes operator for out-of-tree kernel modules
#[derive(Parser, Debug)]
#[command(name = "kmm", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Mode to run in
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator modes
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the module, image-config and node-label controllers (default)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug, Clone, Default)]
pub struct ControllerArgs {
    /// Namespace to watch for Modules; all namespaces when unset
    #[arg(long, env = "KMM_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Image running in-cluster builds
    #[arg(long, env = "KMM_BUILDER_IMAGE", default_value = DEFAULT_BUILDER_IMAGE)]
    pub builder_image: String,

    /// Image running in-cluster signing
    #[arg(long, env = "KMM_SIGNER_IMAGE", default_value = DEFAULT_SIGNER_IMAGE)]
    pub signer_image: String,

    /// Seconds to wait before retrying a failed reconcile
    #[arg(long, env = "KMM_ERROR_REQUEUE_SECS", default_value_t = DEFAULT_ERROR_REQUEUE_SECS)]
    pub error_requeue_secs: u64,
}

/// Validated operator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Watched namespace, `None` for cluster-wide
    pub namespace: Option<String>,
    /// Builder image
    pub builder_image: String,
    /// Signer image
    pub signer_image: String,
    /// Requeue delay after errors
    pub error_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
            signer_image: DEFAULT_SIGNER_IMAGE.to_string(),
            error_requeue: Duration::from_secs(DEFAULT_ERROR_REQUEUE_SECS),
        }
    }
}

impl TryFrom<ControllerArgs> for OperatorConfig {
    type Error = Error;

    fn try_from(args: ControllerArgs) -> Result<Self, Self::Error> {
        let namespace = args
            .namespace
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty());

        if args.builder_image.trim().is_empty() {
            return Err(Error::validation("builder image must not be empty"));
        }
        if args.signer_image.trim().is_empty() {
            return Err(Error::validation("signer image must not be empty"));
        }
        if args.error_requeue_secs == 0 {
            return Err(Error::validation("error requeue delay must be positive"));
        }

        Ok(Self {
            namespace,
            builder_image: args.builder_image,
            signer_image: args.signer_image,
            error_requeue: Duration::from_secs(args.error_requeue_secs),
        })
    }
}
