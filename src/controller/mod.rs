//! Controller implementations for KMM CRDs
//!
//! Four reconcilers share one [`Context`]:
//! - [`module`] converges a Module's build, sign, workloads and status
//! - [`images_config`] keeps a Module's image record current
//! - [`node_label`] keeps a node's readiness label in step with its loader pod
//! - [`node_kernel`] labels each node with the kernel its loaders select on
//!
//! Every collaborator is held as a trait object so the reconcilers can be
//! driven against mocks in tests.

mod client;
mod gc;
mod images_config;
pub mod module;
pub mod node_kernel;
pub mod node_label;
mod status;

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use crate::config::OperatorConfig;
use crate::kernel_mapper::{DefaultKernelMapper, KernelMapper};
use crate::metrics::{MetricsSink, OtelMetrics};
use crate::pipeline::{BuildPipeline, ImagePipeline, KubeJobClient, SignPipeline};
use crate::workload::{KubeWorkloadCreator, WorkloadCreator};

pub use client::{KubeClient, KubeClientImpl};
pub use gc::GarbageCollector;
pub use images_config::{assign_generations, ImagesConfigManager, ImagesConfigReconciler};
pub use status::{compute_status, KubeStatusUpdater, StatusUpdater};

#[cfg(test)]
pub use client::MockKubeClient;

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, &config).build();
/// ```
pub struct Context {
    /// Kubernetes reads and writes
    pub kube: Arc<dyn KubeClient>,
    /// Kernel version resolution
    pub kernel_mapper: Arc<dyn KernelMapper>,
    /// In-cluster build collaborator
    pub build: Arc<dyn ImagePipeline>,
    /// In-cluster sign collaborator
    pub sign: Arc<dyn ImagePipeline>,
    /// Loader and device-plugin workloads
    pub workloads: Arc<dyn WorkloadCreator>,
    /// ModuleImagesConfig upserts
    pub images: Arc<dyn ImagesConfigManager>,
    /// Module status writes
    pub status: Arc<dyn StatusUpdater>,
    /// Aggregate module gauges
    pub metrics: Arc<dyn MetricsSink>,
    /// Delay before retrying a failed reconcile
    pub error_requeue: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: &OperatorConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Garbage collector over this context's collaborators
    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.workloads.clone(), self.build.clone(), self.sign.clone())
    }

    /// Create a context for testing around a mock Kubernetes client
    ///
    /// Every other collaborator is a mock without expectations, so any
    /// call a test does not set up fails loudly.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        use crate::kernel_mapper::MockKernelMapper;
        use crate::metrics::MockMetricsSink;
        use crate::pipeline::MockImagePipeline;
        use crate::workload::MockWorkloadCreator;
        use images_config::MockImagesConfigManager;
        use status::MockStatusUpdater;

        Self {
            kube,
            kernel_mapper: Arc::new(MockKernelMapper::new()),
            build: Arc::new(MockImagePipeline::new()),
            sign: Arc::new(MockImagePipeline::new()),
            workloads: Arc::new(MockWorkloadCreator::new()),
            images: Arc::new(MockImagesConfigManager::new()),
            status: Arc::new(MockStatusUpdater::new()),
            metrics: Arc::new(MockMetricsSink::new()),
            error_requeue: Duration::from_secs(crate::config::DEFAULT_ERROR_REQUEUE_SECS),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Collaborators default to the Kubernetes-backed implementations; any of
/// them can be overridden.
pub struct ContextBuilder {
    client: Client,
    builder_image: String,
    signer_image: String,
    error_requeue: Duration,
    kube: Option<Arc<dyn KubeClient>>,
    kernel_mapper: Option<Arc<dyn KernelMapper>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ContextBuilder {
    fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            client,
            builder_image: config.builder_image.clone(),
            signer_image: config.signer_image.clone(),
            error_requeue: config.error_requeue,
            kube: None,
            kernel_mapper: None,
            metrics: None,
        }
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the kernel mapper
    pub fn kernel_mapper(mut self, mapper: Arc<dyn KernelMapper>) -> Self {
        self.kernel_mapper = Some(mapper);
        self
    }

    /// Override the metrics sink
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let jobs = Arc::new(KubeJobClient::new(self.client.clone()));

        Context {
            kernel_mapper: self
                .kernel_mapper
                .unwrap_or_else(|| Arc::new(DefaultKernelMapper::new())),
            build: Arc::new(BuildPipeline::new(jobs.clone(), self.builder_image)),
            sign: Arc::new(SignPipeline::new(jobs, self.signer_image)),
            workloads: Arc::new(KubeWorkloadCreator::new(self.client)),
            images: Arc::new(ImagesConfigReconciler::new(kube.clone())),
            status: Arc::new(KubeStatusUpdater::new(kube.clone())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(OtelMetrics)),
            error_requeue: self.error_requeue,
            kube,
        }
    }
}
